//! Soft-capped cache of open file handles.
//!
//! Clients own their handles; a process-wide `CacheServer` only coordinates.
//! Each client keeps an age tree over its handles' last-used instants and
//! reports its eldest age to the server on open and close. When the server's
//! open-handle count reaches the soft limit it averages the eldest ages
//! across clients and broadcasts that age; clients then soft-close (flush,
//! sync, drop the OS handle, keep state) anything older. A soft-closed handle
//! reopens transparently at its recorded offset on next use. While over cap
//! the server re-evaluates every `reevaluate` interval.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::core::error::{QueueError, Result};

/// Age broadcast value meaning "no constraint".
const UNCONSTRAINED: u64 = u64::MAX;

fn mono_baseline() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn mono_us(at: Instant) -> u64 {
    at.duration_since(mono_baseline()).as_micros() as u64
}

/// Write-buffer policy for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBuffer {
    /// Every append goes straight to the OS.
    Unbuffered,
    /// Buffer without bound; flushed on sync, seek, read or close.
    Infinity,
    /// Buffer up to this many bytes before flushing.
    Limit(usize),
}

/// Seek targets understood by `maybe_seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTo {
    Bof,
    BofOffset(u64),
    Cur,
    CurOffset(i64),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

#[derive(Debug, Default)]
struct PathUse {
    readers: usize,
    writer: bool,
}

struct ClientRec {
    obey: Arc<AtomicU64>,
    eldest_us: Option<u64>,
    open: usize,
}

struct ServerState {
    limit: usize,
    total_open: usize,
    next_client: u64,
    clients: HashMap<u64, ClientRec>,
    paths: HashMap<PathBuf, PathUse>,
    last_eval: Option<Instant>,
    ticker_running: bool,
}

/// Process-wide coordinator for all `FileCache` clients.
pub struct CacheServer {
    state: Mutex<ServerState>,
    reevaluate: Duration,
}

impl CacheServer {
    pub fn new(limit: usize, reserved: usize, reevaluate: Duration) -> Arc<Self> {
        let limit = if limit == 0 {
            discovered_fd_limit().saturating_sub(reserved).max(1)
        } else {
            limit.saturating_sub(reserved).max(1)
        };
        Arc::new(CacheServer {
            state: Mutex::new(ServerState {
                limit,
                total_open: 0,
                next_client: 0,
                clients: HashMap::new(),
                paths: HashMap::new(),
                last_eval: None,
                ticker_running: false,
            }),
            reevaluate,
        })
    }

    pub fn register_client(self: &Arc<Self>) -> (ClientId, Arc<AtomicU64>) {
        let mut st = self.state.lock();
        let id = st.next_client;
        st.next_client += 1;
        let obey = Arc::new(AtomicU64::new(UNCONSTRAINED));
        st.clients.insert(
            id,
            ClientRec {
                obey: Arc::clone(&obey),
                eldest_us: None,
                open: 0,
            },
        );
        (ClientId(id), obey)
    }

    pub fn deregister_client(&self, client: ClientId) {
        let mut st = self.state.lock();
        if let Some(rec) = st.clients.remove(&client.0) {
            st.total_open -= rec.open;
        }
    }

    fn path_opened(&self, path: &Path, writable: bool) -> Result<()> {
        let mut st = self.state.lock();
        let entry = st.paths.entry(path.to_path_buf()).or_default();
        if writable {
            if entry.writer {
                return Err(QueueError::WriterExists(path.to_path_buf()));
            }
            entry.writer = true;
        } else {
            entry.readers += 1;
        }
        Ok(())
    }

    fn path_closed(&self, path: &Path, writable: bool) {
        let mut st = self.state.lock();
        if let Some(entry) = st.paths.get_mut(path) {
            if writable {
                entry.writer = false;
            } else {
                entry.readers = entry.readers.saturating_sub(1);
            }
            if !entry.writer && entry.readers == 0 {
                st.paths.remove(path);
            }
        }
    }

    /// Client report: `delta` OS handles opened (+) or closed (-), and the
    /// client's current eldest last-used instant.
    fn report(self: &Arc<Self>, client: ClientId, delta: i64, eldest: Option<Instant>) {
        let mut st = self.state.lock();
        if let Some(rec) = st.clients.get_mut(&client.0) {
            rec.open = (rec.open as i64 + delta).max(0) as usize;
            rec.eldest_us = eldest.map(mono_us);
        }
        st.total_open = (st.total_open as i64 + delta).max(0) as usize;
        self.maybe_evaluate(&mut st);
    }

    fn maybe_evaluate(self: &Arc<Self>, st: &mut ServerState) {
        if st.total_open < st.limit {
            for rec in st.clients.values() {
                rec.obey.store(UNCONSTRAINED, Ordering::Relaxed);
            }
            return;
        }
        let due = st
            .last_eval
            .map_or(true, |at| at.elapsed() >= self.reevaluate);
        if due {
            self.evaluate(st);
        }
        if !st.ticker_running {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                st.ticker_running = true;
                let server = Arc::clone(self);
                handle.spawn(async move {
                    loop {
                        tokio::time::sleep(server.reevaluate).await;
                        let mut st = server.state.lock();
                        if st.total_open < st.limit {
                            st.ticker_running = false;
                            break;
                        }
                        server.evaluate(&mut st);
                    }
                });
            }
        }
    }

    /// Average the eldest ages across clients and broadcast the result.
    fn evaluate(&self, st: &mut ServerState) {
        let now = mono_us(Instant::now());
        let ages: Vec<u64> = st
            .clients
            .values()
            .filter_map(|rec| rec.eldest_us.map(|e| now.saturating_sub(e)))
            .collect();
        if ages.is_empty() {
            return;
        }
        let avg = ages.iter().sum::<u64>() / ages.len() as u64;
        debug!(
            open = st.total_open,
            limit = st.limit,
            max_eldest_since_use_us = avg,
            "file cache over limit"
        );
        for rec in st.clients.values() {
            rec.obey.store(avg, Ordering::Relaxed);
        }
        st.last_eval = Some(Instant::now());
    }

    #[cfg(test)]
    fn total_open(&self) -> usize {
        self.state.lock().total_open
    }
}

#[cfg(target_os = "linux")]
fn discovered_fd_limit() -> usize {
    if let Ok(raw) = std::fs::read_to_string("/proc/self/limits") {
        for line in raw.lines() {
            if line.starts_with("Max open files") {
                if let Some(soft) = line.split_whitespace().nth(3) {
                    if let Ok(n) = soft.parse::<usize>() {
                        return n;
                    }
                }
            }
        }
    }
    1024
}

#[cfg(not(target_os = "linux"))]
fn discovered_fd_limit() -> usize {
    1024
}

struct Handle {
    file: Option<File>,
    path: PathBuf,
    readable: bool,
    writable: bool,
    /// Virtual position, including unflushed buffered appends.
    offset: u64,
    /// Position the OS file cursor is known to be at.
    trusted_offset: u64,
    at_eof: bool,
    is_dirty: bool,
    wbuf: Vec<u8>,
    policy: WriteBuffer,
    last_used: Instant,
}

impl Handle {
    fn flush_buffer(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().expect("flushing a soft-closed handle");
        file.write_all(&self.wbuf)?;
        self.trusted_offset += self.wbuf.len() as u64;
        self.wbuf.clear();
        Ok(())
    }
}

/// A per-actor cache of file handles.
///
/// One `FileCache` belongs to exactly one actor; it is not shared.
pub struct FileCache {
    server: Arc<CacheServer>,
    client: ClientId,
    obey: Arc<AtomicU64>,
    handles: HashMap<u64, Handle>,
    /// last-used → ref, eldest first.
    age_tree: BTreeMap<(Instant, u64), u64>,
    next_ref: u64,
}

impl FileCache {
    pub fn new(server: Arc<CacheServer>) -> Self {
        let (client, obey) = server.register_client();
        FileCache {
            server,
            client,
            obey,
            handles: HashMap::new(),
            age_tree: BTreeMap::new(),
            next_ref: 0,
        }
    }

    /// Opens `path`. Writable handles are append-only; a second writable
    /// handle on the same path fails with `WriterExists`.
    pub fn open(
        &mut self,
        path: impl AsRef<Path>,
        readable: bool,
        writable: bool,
        policy: WriteBuffer,
    ) -> Result<HandleRef> {
        self.obey_age_limit()?;
        let path = path.as_ref().to_path_buf();
        self.server.path_opened(&path, writable)?;
        let file = match open_os_file(&path, readable, writable) {
            Ok(f) => f,
            Err(e) => {
                self.server.path_closed(&path, writable);
                return Err(e);
            }
        };
        let end = if writable {
            file.metadata()?.len()
        } else {
            0
        };
        let href = self.next_ref;
        self.next_ref += 1;
        let now = Instant::now();
        self.handles.insert(
            href,
            Handle {
                file: Some(file),
                path,
                readable,
                writable,
                offset: end,
                trusted_offset: end,
                at_eof: writable,
                is_dirty: false,
                wbuf: Vec::new(),
                policy,
                last_used: now,
            },
        );
        self.age_tree.insert((now, href), href);
        self.report(1);
        Ok(HandleRef(href))
    }

    pub fn close(&mut self, href: HandleRef) -> Result<()> {
        let mut handle = self.handles.remove(&href.0).ok_or(QueueError::NotFound)?;
        self.age_tree.remove(&(handle.last_used, href.0));
        let was_open = handle.file.is_some();
        if was_open {
            handle.flush_buffer()?;
            if handle.is_dirty {
                handle.file.as_ref().expect("open handle").sync_all()?;
            }
        }
        self.server.path_closed(&handle.path, handle.writable);
        self.report(if was_open { -1 } else { 0 });
        Ok(())
    }

    /// Reads up to `count` bytes at the current offset.
    pub fn read(&mut self, href: HandleRef, count: usize) -> Result<Vec<u8>> {
        self.obey_age_limit()?;
        let handle = self.touch(href)?;
        if !handle.readable {
            return Err(QueueError::NotOpenForReading(handle.path.clone()));
        }
        handle.flush_buffer()?;
        if handle.trusted_offset != handle.offset {
            let file = handle.file.as_mut().expect("reopened above");
            file.seek(SeekFrom::Start(handle.offset))?;
            handle.trusted_offset = handle.offset;
        }
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        let file = handle.file.as_mut().expect("reopened above");
        while filled < count {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        handle.offset += filled as u64;
        handle.trusted_offset = handle.offset;
        handle.at_eof = filled < count;
        Ok(buf)
    }

    /// Appends `data` at end of file, honouring the write-buffer policy.
    pub fn append(&mut self, href: HandleRef, data: &[u8]) -> Result<u64> {
        self.obey_age_limit()?;
        let handle = self.touch(href)?;
        if !handle.writable {
            return Err(QueueError::NotOpenForWriting(handle.path.clone()));
        }
        let wrote_at = handle.offset;
        match handle.policy {
            WriteBuffer::Unbuffered => {
                let file = handle.file.as_mut().expect("reopened above");
                file.write_all(data)?;
                handle.trusted_offset += data.len() as u64;
            }
            WriteBuffer::Infinity => handle.wbuf.extend_from_slice(data),
            WriteBuffer::Limit(limit) => {
                handle.wbuf.extend_from_slice(data);
                if handle.wbuf.len() >= limit {
                    handle.flush_buffer()?;
                }
            }
        }
        handle.offset += data.len() as u64;
        handle.is_dirty = true;
        handle.at_eof = true;
        Ok(wrote_at)
    }

    pub fn sync(&mut self, href: HandleRef) -> Result<()> {
        self.obey_age_limit()?;
        let handle = self.touch(href)?;
        handle.flush_buffer()?;
        if handle.is_dirty {
            handle.file.as_ref().expect("reopened above").sync_all()?;
            handle.is_dirty = false;
        }
        Ok(())
    }

    /// Repositions the handle, eliding the OS seek when the decision table
    /// says the cursor is already in place.
    pub fn maybe_seek(&mut self, href: HandleRef, to: SeekTo) -> Result<u64> {
        self.obey_age_limit()?;
        let handle = self.touch(href)?;
        let elide = match to {
            SeekTo::Cur | SeekTo::CurOffset(0) => true,
            SeekTo::Bof => handle.offset == 0,
            SeekTo::BofOffset(n) => handle.offset == n,
            SeekTo::Eof => handle.at_eof,
            SeekTo::CurOffset(_) => false,
        };
        if elide {
            trace!(offset = handle.offset, ?to, "seek elided");
            return Ok(handle.offset);
        }
        handle.flush_buffer()?;
        let file = handle.file.as_mut().expect("reopened above");
        let new = match to {
            SeekTo::Bof => file.seek(SeekFrom::Start(0))?,
            SeekTo::BofOffset(n) => file.seek(SeekFrom::Start(n))?,
            SeekTo::CurOffset(d) => {
                // The OS cursor may disagree with the virtual offset.
                let target = handle.offset.saturating_add_signed(d);
                file.seek(SeekFrom::Start(target))?
            }
            SeekTo::Eof => file.seek(SeekFrom::End(0))?,
            SeekTo::Cur => unreachable!("elided above"),
        };
        handle.offset = new;
        handle.trusted_offset = new;
        handle.at_eof = matches!(to, SeekTo::Eof);
        Ok(new)
    }

    pub fn position(&self, href: HandleRef) -> Result<u64> {
        self.handles
            .get(&href.0)
            .map(|h| h.offset)
            .ok_or(QueueError::NotFound)
    }

    /// True when the handle's OS file is currently closed but its state kept.
    pub fn is_soft_closed(&self, href: HandleRef) -> bool {
        self.handles
            .get(&href.0)
            .map(|h| h.file.is_none())
            .unwrap_or(false)
    }

    /// Touch the handle: reopen if soft-closed, bump its age-tree slot.
    fn touch(&mut self, href: HandleRef) -> Result<&mut Handle> {
        let reopened = {
            let handle = self.handles.get_mut(&href.0).ok_or(QueueError::NotFound)?;
            if handle.file.is_none() {
                let file = open_os_file(&handle.path, handle.readable, handle.writable)?;
                handle.file = Some(file);
                // The fresh cursor sits at 0 (read) or EOF (append); the next
                // read re-seeks from trusted_offset.
                handle.trusted_offset = if handle.writable {
                    handle.file.as_ref().expect("just opened").metadata()?.len()
                } else {
                    0
                };
                debug!(path = %handle.path.display(), "reopened soft-closed handle");
                true
            } else {
                false
            }
        };
        let now = Instant::now();
        let handle = self.handles.get_mut(&href.0).expect("checked above");
        let old_used = handle.last_used;
        handle.last_used = now;
        self.age_tree.remove(&(old_used, href.0));
        self.age_tree.insert((now, href.0), href.0);
        if reopened {
            self.report(1);
        }
        Ok(self.handles.get_mut(&href.0).expect("checked above"))
    }

    /// Soft-close every handle older than the broadcast age.
    fn obey_age_limit(&mut self) -> Result<()> {
        let max_age_us = self.obey.load(Ordering::Relaxed);
        if max_age_us == UNCONSTRAINED {
            return Ok(());
        }
        let now = Instant::now();
        let cutoff = now.checked_sub(Duration::from_micros(max_age_us));
        let Some(cutoff) = cutoff else { return Ok(()) };
        let victims: Vec<u64> = self
            .age_tree
            .range(..(cutoff, u64::MAX))
            .map(|(_, &r)| r)
            .collect();
        let mut closed = 0i64;
        for r in victims {
            let handle = self.handles.get_mut(&r).expect("age tree is in sync");
            if handle.file.is_none() {
                continue;
            }
            if let Err(e) = soft_close(handle) {
                warn!(path = %handle.path.display(), error = %e, "soft close failed");
                continue;
            }
            closed -= 1;
        }
        if closed != 0 {
            self.report(closed);
        }
        Ok(())
    }

    fn report(&self, delta: i64) {
        let eldest = self
            .age_tree
            .iter()
            .find(|(_, r)| {
                self.handles
                    .get(r)
                    .map(|h| h.file.is_some())
                    .unwrap_or(false)
            })
            .map(|((at, _), _)| *at);
        self.server.report(self.client, delta, eldest);
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        for (_, handle) in self.handles.iter_mut() {
            if handle.file.is_some() {
                let _ = soft_close(handle);
            }
            self.server.path_closed(&handle.path, handle.writable);
        }
        self.server.deregister_client(self.client);
    }
}

fn soft_close(handle: &mut Handle) -> Result<()> {
    handle.flush_buffer()?;
    if handle.is_dirty {
        handle.file.as_ref().expect("open handle").sync_all()?;
        handle.is_dirty = false;
    }
    handle.file = None;
    Ok(())
}

fn open_os_file(path: &Path, readable: bool, writable: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(readable);
    if writable {
        opts.append(true).create(true);
    }
    Ok(opts.open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server_with_limit(limit: usize) -> Arc<CacheServer> {
        CacheServer::new(limit + 2, 2, Duration::from_millis(1))
    }

    #[test]
    fn append_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let server = server_with_limit(100);
        let mut cache = FileCache::new(Arc::clone(&server));

        let w = cache
            .open(&path, false, true, WriteBuffer::Limit(8))
            .unwrap();
        let at = cache.append(w, b"hello ").unwrap();
        assert_eq!(at, 0);
        let at = cache.append(w, b"world").unwrap();
        assert_eq!(at, 6);
        cache.sync(w).unwrap();

        let r = cache.open(&path, true, false, WriteBuffer::Unbuffered).unwrap();
        let data = cache.read(r, 11).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn second_writer_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("single");
        let server = server_with_limit(100);
        let mut a = FileCache::new(Arc::clone(&server));
        let mut b = FileCache::new(Arc::clone(&server));
        let _w = a.open(&path, false, true, WriteBuffer::Unbuffered).unwrap();
        let err = b
            .open(&path, false, true, WriteBuffer::Unbuffered)
            .unwrap_err();
        assert!(matches!(err, QueueError::WriterExists(_)));
        // Readers are still welcome.
        let _r = b.open(&path, true, false, WriteBuffer::Unbuffered).unwrap();
    }

    #[test]
    fn writer_slot_frees_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w");
        let server = server_with_limit(100);
        let mut cache = FileCache::new(Arc::clone(&server));
        let w = cache.open(&path, false, true, WriteBuffer::Unbuffered).unwrap();
        cache.close(w).unwrap();
        let _w2 = cache.open(&path, false, true, WriteBuffer::Unbuffered).unwrap();
    }

    #[test]
    fn over_limit_soft_closes_and_reopens_transparently() {
        let dir = TempDir::new().unwrap();
        let server = server_with_limit(2);
        let mut cache = FileCache::new(Arc::clone(&server));

        let a = cache
            .open(dir.path().join("a"), false, true, WriteBuffer::Unbuffered)
            .unwrap();
        cache.append(a, b"aaaa").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = cache
            .open(dir.path().join("b"), false, true, WriteBuffer::Unbuffered)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Third open pushes the count to the limit; the server broadcasts an
        // age and the next operation soft-closes the eldest handles.
        let c = cache
            .open(dir.path().join("c"), false, true, WriteBuffer::Unbuffered)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.append(c, b"cc").unwrap();

        assert!(cache.is_soft_closed(a) || cache.is_soft_closed(b));
        assert!(server.total_open() < 3);

        // Soft-closed handles come back at their recorded offset.
        let at = cache.append(a, b"bbbb").unwrap();
        assert_eq!(at, 4);
        assert!(!cache.is_soft_closed(a));
    }

    #[test]
    fn maybe_seek_elides_and_moves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seek");
        let server = server_with_limit(100);
        let mut cache = FileCache::new(Arc::clone(&server));
        let w = cache.open(&path, false, true, WriteBuffer::Unbuffered).unwrap();
        cache.append(w, b"0123456789").unwrap();
        cache.sync(w).unwrap();
        cache.close(w).unwrap();

        let r = cache.open(&path, true, false, WriteBuffer::Unbuffered).unwrap();
        assert_eq!(cache.maybe_seek(r, SeekTo::Bof).unwrap(), 0);
        assert_eq!(cache.maybe_seek(r, SeekTo::Cur).unwrap(), 0);
        assert_eq!(cache.maybe_seek(r, SeekTo::BofOffset(4)).unwrap(), 4);
        assert_eq!(cache.maybe_seek(r, SeekTo::CurOffset(0)).unwrap(), 4);
        assert_eq!(cache.maybe_seek(r, SeekTo::CurOffset(3)).unwrap(), 7);
        let data = cache.read(r, 3).unwrap();
        assert_eq!(&data, b"789");
        assert_eq!(cache.maybe_seek(r, SeekTo::Eof).unwrap(), 10);
    }

    #[test]
    fn read_on_append_only_handle_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        let server = server_with_limit(100);
        let mut cache = FileCache::new(Arc::clone(&server));
        let w = cache.open(&path, false, true, WriteBuffer::Unbuffered).unwrap();
        assert!(matches!(
            cache.read(w, 1).unwrap_err(),
            QueueError::NotOpenForReading(_)
        ));
        let r = cache.open(&path, true, false, WriteBuffer::Unbuffered).unwrap();
        assert!(matches!(
            cache.append(r, b"y").unwrap_err(),
            QueueError::NotOpenForWriting(_)
        ));
    }
}

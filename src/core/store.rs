//! Message store: body persistence for the queue pipeline.
//!
//! The store is an external collaborator of the variable queue; only this
//! interface is relied upon. Two implementations are provided: a file-backed
//! store doing its I/O through the file-handle cache, and an in-process store
//! for transient queues and tests (its syncs can be deferred to exercise the
//! commit fence).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::{QueueError, Result};
use crate::core::file_cache::{CacheServer, FileCache, HandleRef, SeekTo, WriteBuffer};
use crate::core::message::{Message, MessageId};

/// Callback fired once a batch of ids is safely on disk.
pub type SyncDone = Box<dyn FnOnce() + Send>;

pub trait MessageStore: Send {
    /// Append a message body. Idempotent per id.
    fn write(&mut self, msg: &Message) -> Result<()>;

    /// Load a message body back. `NotFound` if it was never written or has
    /// been removed.
    fn read(&mut self, id: MessageId) -> Result<Arc<Message>>;

    fn contains(&self, id: MessageId) -> bool;

    /// Forget bodies entirely.
    fn remove(&mut self, ids: &[MessageId]);

    /// Drop bodies from the hot cache but keep them readable from disk.
    fn release(&mut self, ids: &[MessageId]);

    /// Ensure `ids` are durable, then fire `on_done`. Completion may be
    /// asynchronous; the ids also become visible via `drain_confirmed`.
    fn sync(&mut self, ids: Vec<MessageId>, on_done: SyncDone) -> Result<()>;

    /// Ids confirmed durable since the last drain.
    fn drain_confirmed(&mut self) -> Vec<MessageId>;
}

/// File-backed store: one append-only body log per queue.
pub struct FileStore {
    cache: FileCache,
    writer: HandleRef,
    reader: HandleRef,
    locations: HashMap<MessageId, (u64, u32)>,
    hot: HashMap<MessageId, Arc<Message>>,
    confirmed: Vec<MessageId>,
}

impl FileStore {
    pub fn open(server: Arc<CacheServer>, dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join("bodies.log");
        let mut cache = FileCache::new(server);
        let writer = cache.open(&path, false, true, WriteBuffer::Limit(64 * 1024))?;
        let reader = cache.open(&path, true, false, WriteBuffer::Unbuffered)?;
        Ok(FileStore {
            cache,
            writer,
            reader,
            locations: HashMap::new(),
            hot: HashMap::new(),
            confirmed: Vec::new(),
        })
    }
}

impl MessageStore for FileStore {
    fn write(&mut self, msg: &Message) -> Result<()> {
        if self.locations.contains_key(&msg.id()) {
            return Ok(());
        }
        let body = bincode::serialize(msg)?;
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        let at = self.cache.append(self.writer, &framed)?;
        self.locations.insert(msg.id(), (at, framed.len() as u32));
        self.hot.insert(msg.id(), Arc::new(msg.clone()));
        Ok(())
    }

    fn read(&mut self, id: MessageId) -> Result<Arc<Message>> {
        if let Some(msg) = self.hot.get(&id) {
            return Ok(Arc::clone(msg));
        }
        let &(at, len) = self.locations.get(&id).ok_or(QueueError::NotFound)?;
        // Unflushed appends must hit the OS before the reader can see them.
        self.cache.sync(self.writer)?;
        self.cache.maybe_seek(self.reader, SeekTo::BofOffset(at))?;
        let framed = self.cache.read(self.reader, len as usize)?;
        if framed.len() < 4 {
            return Err(QueueError::NotFound);
        }
        let msg: Message = bincode::deserialize(&framed[4..])?;
        let msg = Arc::new(msg);
        self.hot.insert(id, Arc::clone(&msg));
        Ok(msg)
    }

    fn contains(&self, id: MessageId) -> bool {
        self.locations.contains_key(&id)
    }

    fn remove(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.locations.remove(id);
            self.hot.remove(id);
        }
    }

    fn release(&mut self, ids: &[MessageId]) {
        for id in ids {
            self.hot.remove(id);
        }
    }

    fn sync(&mut self, ids: Vec<MessageId>, on_done: SyncDone) -> Result<()> {
        self.cache.sync(self.writer)?;
        debug!(count = ids.len(), "store sync");
        self.confirmed
            .extend(ids.iter().filter(|id| self.locations.contains_key(id)));
        on_done();
        Ok(())
    }

    fn drain_confirmed(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.confirmed)
    }
}

#[derive(Default)]
struct MemStoreInner {
    bodies: HashMap<MessageId, Arc<Message>>,
    hot: HashMap<MessageId, Arc<Message>>,
    confirmed: Vec<MessageId>,
    defer_sync: bool,
    pending: Vec<(Vec<MessageId>, SyncDone)>,
}

/// In-process store for transient queues. Clones share state, so a test can
/// keep a handle while the variable queue owns another.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold sync completions until `complete_syncs` is called.
    pub fn defer_syncs(&self) {
        self.inner.lock().defer_sync = true;
    }

    /// Fire every held sync completion, in submission order.
    pub fn complete_syncs(&self) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        for (ids, on_done) in pending {
            self.inner.lock().confirmed.extend(ids);
            on_done();
        }
    }

    pub fn pending_sync_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hot_len(&self) -> usize {
        self.inner.lock().hot.len()
    }
}

impl MessageStore for MemStore {
    fn write(&mut self, msg: &Message) -> Result<()> {
        let mut inner = self.inner.lock();
        let arc = Arc::new(msg.clone());
        if inner.bodies.insert(msg.id(), Arc::clone(&arc)).is_none() && !inner.defer_sync {
            // In-process storage: a write is durable the moment it lands.
            inner.confirmed.push(msg.id());
        }
        inner.hot.insert(msg.id(), arc);
        Ok(())
    }

    fn read(&mut self, id: MessageId) -> Result<Arc<Message>> {
        let mut inner = self.inner.lock();
        let msg = inner.bodies.get(&id).cloned().ok_or(QueueError::NotFound)?;
        inner.hot.insert(id, Arc::clone(&msg));
        Ok(msg)
    }

    fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().bodies.contains_key(&id)
    }

    fn remove(&mut self, ids: &[MessageId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.bodies.remove(id);
            inner.hot.remove(id);
        }
    }

    fn release(&mut self, ids: &[MessageId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.hot.remove(id);
        }
    }

    fn sync(&mut self, ids: Vec<MessageId>, on_done: SyncDone) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.defer_sync {
            inner.pending.push((ids, on_done));
        } else {
            inner.confirmed.extend(ids);
            drop(inner);
            on_done();
        }
        Ok(())
    }

    fn drain_confirmed(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.inner.lock().confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn file_store_round_trip_and_release() {
        let dir = TempDir::new().unwrap();
        let server = CacheServer::new(64, 2, Duration::from_secs(2));
        let mut store = FileStore::open(server, dir.path()).unwrap();

        let m1 = Message::new("first body", true);
        let m2 = Message::new("second body", true);
        store.write(&m1).unwrap();
        store.write(&m2).unwrap();

        // Drop the hot cache; reads must come back from disk.
        store.release(&[m1.id(), m2.id()]);
        let back = store.read(m2.id()).unwrap();
        assert_eq!(back.id(), m2.id());
        assert_eq!(back.payload().as_ref(), b"second body");
        let back = store.read(m1.id()).unwrap();
        assert_eq!(back.payload().as_ref(), b"first body");

        store.remove(&[m1.id()]);
        assert!(matches!(store.read(m1.id()), Err(QueueError::NotFound)));
        assert!(store.contains(m2.id()));
    }

    #[test]
    fn file_store_confirms_after_sync() {
        let dir = TempDir::new().unwrap();
        let server = CacheServer::new(64, 2, Duration::from_secs(2));
        let mut store = FileStore::open(server, dir.path()).unwrap();
        let m = Message::new("durable", true);
        store.write(&m).unwrap();
        assert!(store.drain_confirmed().is_empty());
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        store
            .sync(vec![m.id()], Box::new(move || *flag.lock() = true))
            .unwrap();
        assert!(*fired.lock());
        assert_eq!(store.drain_confirmed(), vec![m.id()]);
    }

    #[test]
    fn mem_store_deferred_sync() {
        let store = MemStore::new();
        store.defer_syncs();
        let mut writer = store.clone();
        let m = Message::new("x", true);
        writer.write(&m).unwrap();

        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        writer
            .sync(vec![m.id()], Box::new(move || *flag.lock() = true))
            .unwrap();
        assert!(!*fired.lock());
        assert!(writer.drain_confirmed().is_empty());

        store.complete_syncs();
        assert!(*fired.lock());
        assert_eq!(writer.drain_confirmed(), vec![m.id()]);
    }
}

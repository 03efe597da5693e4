//! Queue index: per-queue on-disk record of publishes, deliveries and acks,
//! addressed in segments of contiguous seq_ids.
//!
//! Like the message store, the index is an external collaborator; the
//! variable queue relies only on this interface. The segmented default
//! journals every operation through the file-handle cache; the in-process
//! variant backs transient queues and unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::Result;
use crate::core::file_cache::{CacheServer, FileCache, HandleRef, WriteBuffer};
use crate::core::message::MessageId;
use crate::core::SeqId;

/// A live (unacked) index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub seq_id: SeqId,
    pub msg_id: MessageId,
    pub is_persistent: bool,
    pub is_delivered: bool,
}

pub trait QueueIndex: Send {
    fn publish(&mut self, seq_id: SeqId, msg_id: MessageId, is_persistent: bool) -> Result<()>;

    /// Record that `seq_id` has been handed to a consumer.
    fn deliver(&mut self, seq_id: SeqId) -> Result<()>;

    /// Remove records; acked entries never come back from `read_segment`.
    fn ack(&mut self, seq_ids: &[SeqId]) -> Result<()>;

    /// Make the journal durable up to and including `seq_ids`.
    fn sync(&mut self, seq_ids: &[SeqId]) -> Result<()>;

    /// Live entries within the segment containing `from`, ascending.
    fn read_segment(&mut self, from: SeqId) -> Result<Vec<IndexEntry>>;

    fn segment_size(&self) -> u64;

    /// First seq_id after the segment containing `seq_id`.
    fn next_segment_boundary(&self, seq_id: SeqId) -> SeqId {
        let size = self.segment_size();
        (seq_id / size + 1) * size
    }

    fn flush_journal(&mut self) -> Result<()>;

    fn needs_flush(&self) -> bool;

    /// Drop every record and any on-disk state, irrevocably.
    fn delete_and_terminate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Rec {
    msg_id: MessageId,
    is_persistent: bool,
    is_delivered: bool,
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalOp {
    Publish {
        seq_id: SeqId,
        msg_id: MessageId,
        is_persistent: bool,
    },
    Deliver {
        seq_id: SeqId,
    },
    Ack {
        seq_id: SeqId,
    },
}

/// Segmented, journal-backed index.
pub struct SegmentedIndex {
    segment_size: u64,
    entries: BTreeMap<SeqId, Rec>,
    cache: FileCache,
    journal: HandleRef,
    journal_path: PathBuf,
    unflushed: usize,
}

impl SegmentedIndex {
    pub fn open(
        server: Arc<CacheServer>,
        dir: impl AsRef<Path>,
        segment_size: u64,
    ) -> Result<Self> {
        assert!(segment_size > 0, "segment size must be positive");
        std::fs::create_dir_all(dir.as_ref())?;
        let journal_path = dir.as_ref().join("journal.idx");
        let mut cache = FileCache::new(server);
        let journal = cache.open(&journal_path, false, true, WriteBuffer::Limit(32 * 1024))?;
        Ok(SegmentedIndex {
            segment_size,
            entries: BTreeMap::new(),
            cache,
            journal,
            journal_path,
            unflushed: 0,
        })
    }

    fn journal_op(&mut self, op: &JournalOp) -> Result<()> {
        let body = bincode::serialize(op)?;
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        self.cache.append(self.journal, &framed)?;
        self.unflushed += 1;
        Ok(())
    }
}

impl QueueIndex for SegmentedIndex {
    fn publish(&mut self, seq_id: SeqId, msg_id: MessageId, is_persistent: bool) -> Result<()> {
        self.entries.insert(
            seq_id,
            Rec {
                msg_id,
                is_persistent,
                is_delivered: false,
            },
        );
        self.journal_op(&JournalOp::Publish {
            seq_id,
            msg_id,
            is_persistent,
        })
    }

    fn deliver(&mut self, seq_id: SeqId) -> Result<()> {
        if let Some(rec) = self.entries.get_mut(&seq_id) {
            if rec.is_delivered {
                return Ok(());
            }
            rec.is_delivered = true;
        }
        self.journal_op(&JournalOp::Deliver { seq_id })
    }

    fn ack(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        for &seq_id in seq_ids {
            if self.entries.remove(&seq_id).is_some() {
                self.journal_op(&JournalOp::Ack { seq_id })?;
            }
        }
        Ok(())
    }

    fn sync(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        debug!(count = seq_ids.len(), "index sync");
        self.flush_journal()
    }

    fn read_segment(&mut self, from: SeqId) -> Result<Vec<IndexEntry>> {
        let start = from / self.segment_size * self.segment_size;
        let end = start + self.segment_size;
        Ok(self
            .entries
            .range(start..end)
            .map(|(&seq_id, rec)| IndexEntry {
                seq_id,
                msg_id: rec.msg_id,
                is_persistent: rec.is_persistent,
                is_delivered: rec.is_delivered,
            })
            .collect())
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn flush_journal(&mut self) -> Result<()> {
        if self.unflushed > 0 {
            self.cache.sync(self.journal)?;
            self.unflushed = 0;
        }
        Ok(())
    }

    fn needs_flush(&self) -> bool {
        self.unflushed > 0
    }

    fn delete_and_terminate(&mut self) -> Result<()> {
        self.entries.clear();
        self.cache.close(self.journal)?;
        if self.journal_path.exists() {
            std::fs::remove_file(&self.journal_path)?;
        }
        Ok(())
    }
}

/// In-process index for transient queues.
pub struct MemIndex {
    segment_size: u64,
    entries: BTreeMap<SeqId, Rec>,
}

impl MemIndex {
    pub fn new(segment_size: u64) -> Self {
        assert!(segment_size > 0, "segment size must be positive");
        MemIndex {
            segment_size,
            entries: BTreeMap::new(),
        }
    }
}

impl QueueIndex for MemIndex {
    fn publish(&mut self, seq_id: SeqId, msg_id: MessageId, is_persistent: bool) -> Result<()> {
        self.entries.insert(
            seq_id,
            Rec {
                msg_id,
                is_persistent,
                is_delivered: false,
            },
        );
        Ok(())
    }

    fn deliver(&mut self, seq_id: SeqId) -> Result<()> {
        if let Some(rec) = self.entries.get_mut(&seq_id) {
            rec.is_delivered = true;
        }
        Ok(())
    }

    fn ack(&mut self, seq_ids: &[SeqId]) -> Result<()> {
        for seq_id in seq_ids {
            self.entries.remove(seq_id);
        }
        Ok(())
    }

    fn sync(&mut self, _seq_ids: &[SeqId]) -> Result<()> {
        Ok(())
    }

    fn read_segment(&mut self, from: SeqId) -> Result<Vec<IndexEntry>> {
        let start = from / self.segment_size * self.segment_size;
        let end = start + self.segment_size;
        Ok(self
            .entries
            .range(start..end)
            .map(|(&seq_id, rec)| IndexEntry {
                seq_id,
                msg_id: rec.msg_id,
                is_persistent: rec.is_persistent,
                is_delivered: rec.is_delivered,
            })
            .collect())
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn flush_journal(&mut self) -> Result<()> {
        Ok(())
    }

    fn needs_flush(&self) -> bool {
        false
    }

    fn delete_and_terminate(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

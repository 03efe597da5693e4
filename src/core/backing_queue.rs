//! The backing-queue contract: the pluggable storage pipeline behind a queue
//! actor. The variable queue is the canonical implementation.

use std::sync::Arc;

use crate::core::error::Result;
use crate::core::message::{Message, MessageId, MessageProps};
use crate::core::store::SyncDone;
use crate::core::SeqId;

/// Opaque receipt a consumer returns to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTag {
    /// Transient delivery with no index entry behind it.
    NotOnDisk { seq_id: SeqId },
    /// Persistent delivery; acking must erase both store body and index entry.
    OnDisk { msg_id: MessageId, seq_id: SeqId },
}

impl AckTag {
    pub fn seq_id(&self) -> SeqId {
        match *self {
            AckTag::NotOnDisk { seq_id } | AckTag::OnDisk { seq_id, .. } => seq_id,
        }
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub message: Arc<Message>,
    /// Whether this message had already been handed to a consumer before.
    pub is_delivered: bool,
    pub ack_tag: Option<AckTag>,
    /// Queue length after this fetch.
    pub remaining: u64,
}

/// What kind of wake-up the backing queue wants from its owning actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutNeed {
    /// Pending commit work: wake after the short sync timeout.
    Timed,
    /// Journal worth flushing: wake when otherwise idle.
    Idle,
    /// Nothing pending.
    False,
}

/// Transaction handle for the publish/ack commit fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

/// Called with `Ok` once a commit is fully applied.
pub type TxReplier = Box<dyn FnOnce() + Send>;

/// A deferred operation applied to the backing queue from its owning actor.
pub type BqOp = Box<dyn FnOnce(&mut dyn BackingQueue) + Send>;

/// Per-stage depths, for introspection and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageDepths {
    pub q1: usize,
    pub q2: usize,
    pub delta: u64,
    pub q3: usize,
    pub q4: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BqStatus {
    pub len: u64,
    pub depths: StageDepths,
    pub next_seq_id: SeqId,
    pub ram_msg_count: u64,
    pub ram_index_count: u64,
    pub target_ram_msg_count: Option<u64>,
    pub avg_ingress_rate: f64,
    pub avg_egress_rate: f64,
}

pub trait BackingQueue: Send {
    /// Enqueue a message; returns the seq_id it was assigned.
    fn publish(&mut self, msg: Arc<Message>) -> Result<SeqId>;

    /// Record a message as delivered without it ever entering the queue
    /// (the queue must be empty). Returns an ack-tag when one is required.
    fn publish_delivered(&mut self, ack_required: bool, msg: Arc<Message>)
        -> Result<Option<AckTag>>;

    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>>;

    fn ack(&mut self, tags: &[AckTag]) -> Result<()>;

    /// Re-enqueue previously delivered messages, oldest first. Each message
    /// is re-published with its delivered flag set and its on-disk body
    /// preserved where the tag says one exists.
    fn requeue(&mut self, pairs: Vec<(AckTag, Arc<Message>)>) -> Result<()>;

    /// Drop head messages while `pred` holds; returns how many were dropped.
    fn dropwhile(&mut self, pred: &mut dyn FnMut(&MessageProps) -> bool) -> Result<u64>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued message; returns how many went.
    fn purge(&mut self) -> Result<u64>;

    /// Purge, then sweep and erase the index.
    fn delete_and_terminate(&mut self) -> Result<u64>;

    /// Orderly shutdown: flush what needs flushing, keep disk state.
    fn terminate(&mut self) -> Result<()>;

    fn tx_publish(&mut self, txn: TxnId, msg: Arc<Message>) -> Result<()>;

    fn tx_ack(&mut self, txn: TxnId, tags: Vec<AckTag>) -> Result<()>;

    /// Abandon a transaction; returns its acks so the caller can restore them.
    fn tx_rollback(&mut self, txn: TxnId) -> Result<Vec<AckTag>>;

    /// Commit a transaction. `on_persisted` fires when the message store has
    /// synced the transaction's persistent bodies; the owning actor must then
    /// call `tx_commit_post_store_sync`. Returns true when completion was
    /// deferred behind such a sync.
    fn tx_commit(&mut self, txn: TxnId, on_persisted: SyncDone, replier: TxReplier)
        -> Result<bool>;

    /// Finalise commits whose store sync has completed.
    fn tx_commit_post_store_sync(&mut self) -> Result<()>;

    /// True while commits are parked waiting for a store sync.
    fn needs_sync(&self) -> bool;

    fn flush_journal(&mut self) -> Result<()>;

    fn status(&self) -> BqStatus;

    /// Seconds of messages currently held in RAM at the observed rates.
    fn ram_duration(&mut self) -> f64;

    /// Seconds of messages to keep in RAM. `None` disables the cap.
    fn set_ram_duration_target(&mut self, duration_s: Option<f64>) -> Result<()>;

    /// Periodic rate remeasurement; recomputes the RAM target.
    fn update_ram_duration(&mut self) -> Result<()>;

    fn is_duplicate(&self, msg: &Message) -> bool;

    /// Drop a message that will never be queued (routing decided against it).
    fn discard(&mut self, msg: Arc<Message>) -> Result<()>;

    /// Apply a deferred operation to this backing queue.
    fn invoke(&mut self, op: BqOp);

    fn needs_timeout(&self) -> TimeoutNeed;

    fn handle_pre_hibernate(&mut self) -> Result<()>;

    /// Message ids confirmed durable since the last drain.
    fn drain_confirmed(&mut self) -> Vec<MessageId>;
}

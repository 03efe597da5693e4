//! The variable queue: a tiered message residency engine.
//!
//! Messages live in one of three forms. Alphas hold body and index in
//! memory, betas hold the body on disk with the index in memory, and the
//! delta region is wholly on disk. Five stages hold them, oldest first:
//!
//! ```text
//!   q4 (alphas)  q3 (betas)  delta  q2 (betas)  q1 (alphas)
//! ```
//!
//! Publishes land in q1, or straight in q4 when q2, delta and q3 are all
//! empty. Fetches drain q4, refilling it from q3, which in turn refills one
//! index segment at a time from delta. A live-estimated ingress/egress rate
//! and a RAM duration target decide how much stays resident; shrinking the
//! target pushes alphas out to betas and, at target zero, betas out to the
//! delta region, never mixing in-memory and on-disk entries within one index
//! segment.
//!
//! Invariants kept across every operation:
//!   * seq_ids ascend across q4 < q3 < delta < q2 < q1
//!   * `len = |q1| + |q2| + delta.count + |q3| + |q4|`
//!   * `ram_msg_count = |q1| + |q4|`
//!   * q2 non-empty implies delta non-empty; q1 non-empty implies the
//!     middle (q2, delta, q3) non-empty
//!   * per message, `index_on_disk` implies `msg_on_disk`
//!   * `delta.count <= delta.end - delta.start`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::core::backing_queue::{
    AckTag, BackingQueue, BqOp, BqStatus, Fetched, StageDepths, TimeoutNeed, TxReplier, TxnId,
};
use crate::core::error::Result;
use crate::core::index::QueueIndex;
use crate::core::message::{Message, MessageId, MessageProps};
use crate::core::store::{MessageStore, SyncDone};
use crate::core::SeqId;

/// Betas whose index entries live only in RAM are flushed to disk in batches
/// of at least this many.
pub const RAM_INDEX_BATCH_SIZE: u64 = 64;

/// Residency decided for a message before it is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    /// Body in memory (alpha).
    Msg,
    /// Body on disk, index in memory (beta).
    Index,
    /// Body and index on disk (delta).
    Neither,
}

/// The queue's envelope around one message.
#[derive(Debug, Clone)]
struct MsgStatus {
    seq_id: SeqId,
    msg_id: MessageId,
    msg: Option<Arc<Message>>,
    is_persistent: bool,
    is_delivered: bool,
    msg_on_disk: bool,
    index_on_disk: bool,
}

/// Contiguous wholly-on-disk region. `end` is exclusive; the region may have
/// gaps, so `count <= end - start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Delta {
    start: SeqId,
    count: u64,
    end: SeqId,
}

#[derive(Debug, Clone, Copy)]
struct RateEstimator {
    avg: f64,
    count: u64,
    prev_count: u64,
    prev_instant: Instant,
    cur_instant: Instant,
}

impl RateEstimator {
    fn new(now: Instant) -> Self {
        RateEstimator {
            avg: 0.0,
            count: 0,
            prev_count: 0,
            prev_instant: now,
            cur_instant: now,
        }
    }

    fn tick(&mut self) {
        self.count += 1;
    }

    /// Messages per second over the last two measurement intervals.
    fn remeasure(&mut self, now: Instant) {
        let span_us = now.duration_since(self.prev_instant).as_micros() as f64;
        self.avg = if span_us > 0.0 {
            (self.count + self.prev_count) as f64 * 1_000_000.0 / span_us
        } else {
            0.0
        };
        self.prev_count = self.count;
        self.count = 0;
        self.prev_instant = self.cur_instant;
        self.cur_instant = now;
    }
}

#[derive(Default)]
struct Txn {
    pubs: Vec<Arc<Message>>,
    acks: Vec<AckTag>,
}

/// Commits parked behind the store sync fence.
#[derive(Default)]
struct OnSync {
    acks: Vec<Vec<AckTag>>,
    pubs: Vec<Vec<Arc<Message>>>,
    repliers: Vec<TxReplier>,
}

impl OnSync {
    fn is_empty(&self) -> bool {
        self.repliers.is_empty()
    }
}

pub struct VariableQueue {
    q1: VecDeque<MsgStatus>,
    q2: VecDeque<MsgStatus>,
    delta: Delta,
    q3: VecDeque<MsgStatus>,
    q4: VecDeque<MsgStatus>,
    next_seq_id: SeqId,
    len: u64,
    ram_msg_count: u64,
    ram_index_count: u64,
    target_ram_msg_count: Option<u64>,
    duration_target: Option<f64>,
    ingress: RateEstimator,
    egress: RateEstimator,
    durable: bool,
    store: Box<dyn MessageStore>,
    index: Box<dyn QueueIndex>,
    txns: HashMap<TxnId, Txn>,
    on_sync: OnSync,
    outstanding_syncs: usize,
}

impl VariableQueue {
    pub fn new(
        store: Box<dyn MessageStore>,
        index: Box<dyn QueueIndex>,
        durable: bool,
        duration_target_s: Option<f64>,
    ) -> Self {
        let now = Instant::now();
        VariableQueue {
            q1: VecDeque::new(),
            q2: VecDeque::new(),
            delta: Delta::default(),
            q3: VecDeque::new(),
            q4: VecDeque::new(),
            next_seq_id: 0,
            len: 0,
            ram_msg_count: 0,
            ram_index_count: 0,
            target_ram_msg_count: None,
            duration_target: duration_target_s,
            ingress: RateEstimator::new(now),
            egress: RateEstimator::new(now),
            durable,
            store,
            index,
            txns: HashMap::new(),
            on_sync: OnSync::default(),
            outstanding_syncs: 0,
        }
    }

    /// Decide a residency class for the next publish.
    fn classify(&self) -> Residency {
        match self.target_ram_msg_count {
            None => Residency::Msg,
            Some(0) => match self.q3.front() {
                None => Residency::Index,
                Some(head) => {
                    if self.next_seq_id >= self.index.next_segment_boundary(head.seq_id) {
                        Residency::Neither
                    } else {
                        Residency::Index
                    }
                }
            },
            Some(target) if target > self.ram_msg_count => Residency::Msg,
            Some(_) => {
                if self.q1.is_empty() {
                    Residency::Index
                } else {
                    // Let q1 elders spill below instead.
                    Residency::Msg
                }
            }
        }
    }

    fn publish_internal(
        &mut self,
        msg: Arc<Message>,
        is_delivered: bool,
        msg_on_disk: bool,
    ) -> Result<SeqId> {
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        let mut ms = MsgStatus {
            seq_id,
            msg_id: msg.id(),
            is_persistent: msg.is_persistent() && self.durable,
            is_delivered,
            msg_on_disk,
            index_on_disk: false,
            msg: Some(msg),
        };
        let class = self.classify();
        trace!(seq_id, ?class, "publish");
        match class {
            Residency::Msg => {
                write_msg_to_disk(&mut *self.store, false, &mut ms)?;
                write_index_to_disk(&mut *self.index, false, &mut ms)?;
                if self.q2.is_empty() && self.delta.count == 0 && self.q3.is_empty() {
                    self.q4.push_back(ms);
                } else {
                    self.q1.push_back(ms);
                }
                self.ram_msg_count += 1;
                self.maybe_spill_q1()?;
            }
            Residency::Index => {
                debug_assert!(self.q1.is_empty());
                write_msg_to_disk(&mut *self.store, true, &mut ms)?;
                write_index_to_disk(&mut *self.index, false, &mut ms)?;
                ms.msg = None;
                if !ms.index_on_disk {
                    self.ram_index_count += 1;
                }
                if self.delta.count == 0 {
                    self.q3.push_back(ms);
                } else {
                    self.q2.push_back(ms);
                }
            }
            Residency::Neither => {
                debug_assert!(self.q1.is_empty() && self.q2.is_empty());
                write_msg_to_disk(&mut *self.store, true, &mut ms)?;
                write_index_to_disk(&mut *self.index, true, &mut ms)?;
                self.extend_delta(seq_id);
            }
        }
        self.len += 1;
        self.ingress.tick();
        self.limit_ram_index()?;
        #[cfg(debug_assertions)]
        self.check_invariants();
        Ok(seq_id)
    }

    /// Spill q1 elders to beta form while over the RAM target.
    fn maybe_spill_q1(&mut self) -> Result<()> {
        let target = match self.target_ram_msg_count {
            Some(t) => t,
            None => return Ok(()),
        };
        while self.ram_msg_count > target {
            let Some(mut ms) = self.q1.pop_front() else { break };
            self.alpha_to_beta(&mut ms)?;
            if self.delta.count == 0 {
                self.q3.push_back(ms);
            } else {
                self.q2.push_back(ms);
            }
        }
        Ok(())
    }

    fn alpha_to_beta(&mut self, ms: &mut MsgStatus) -> Result<()> {
        write_msg_to_disk(&mut *self.store, true, ms)?;
        write_index_to_disk(&mut *self.index, false, ms)?;
        ms.msg = None;
        self.ram_msg_count -= 1;
        if !ms.index_on_disk {
            self.ram_index_count += 1;
        }
        Ok(())
    }

    fn extend_delta(&mut self, seq_id: SeqId) {
        let size = self.index.segment_size();
        let aligned = seq_id / size * size;
        if self.delta.count == 0 {
            self.delta = Delta {
                start: aligned,
                count: 1,
                end: seq_id + 1,
            };
        } else {
            self.delta.start = self.delta.start.min(aligned);
            self.delta.end = self.delta.end.max(seq_id + 1);
            self.delta.count += 1;
        }
    }

    /// Pop the queue's head as an alpha, refilling q4 along the way.
    /// The popped message leaves the RAM count; `len` is untouched.
    fn queue_out(&mut self) -> Result<Option<MsgStatus>> {
        loop {
            if let Some(ms) = self.q4.pop_front() {
                self.ram_msg_count -= 1;
                return Ok(Some(ms));
            }
            if self.q3.is_empty() {
                if self.delta.count > 0 {
                    self.deltas_to_betas()?;
                    continue;
                }
                debug_assert!(self.q1.is_empty() && self.q2.is_empty());
                return Ok(None);
            }
            let mut ms = self.q3.pop_front().expect("checked non-empty");
            // Beta back to alpha: reload the body.
            if ms.msg.is_none() {
                ms.msg = Some(self.store.read(ms.msg_id)?);
            }
            if !ms.index_on_disk {
                self.ram_index_count -= 1;
            }
            self.ram_msg_count += 1;
            self.q4.push_back(ms);
            if self.q3.is_empty() {
                if self.delta.count == 0 {
                    // End of the pipeline chain: q1's alphas become eldest.
                    debug_assert!(self.q2.is_empty());
                    self.q4.append(&mut self.q1);
                } else {
                    self.deltas_to_betas()?;
                }
            }
        }
    }

    fn unget(&mut self, ms: MsgStatus) {
        self.ram_msg_count += 1;
        self.q4.push_front(ms);
    }

    /// Refill q3 with one index segment's worth of the delta region.
    fn deltas_to_betas(&mut self) -> Result<()> {
        while self.delta.count > 0 {
            let start = self.delta.start;
            let boundary = self.index.next_segment_boundary(start);
            let entries = self.index.read_segment(start)?;
            let mut loaded = 0u64;
            for e in entries {
                if e.seq_id < self.delta.start || e.seq_id >= self.delta.end {
                    continue;
                }
                self.q3.push_back(MsgStatus {
                    seq_id: e.seq_id,
                    msg_id: e.msg_id,
                    msg: None,
                    is_persistent: e.is_persistent,
                    is_delivered: e.is_delivered,
                    msg_on_disk: true,
                    index_on_disk: true,
                });
                loaded += 1;
            }
            debug!(start, boundary, loaded, "delta segment loaded");
            self.delta.count -= loaded;
            if self.delta.count == 0 {
                // Delta exhausted; q2's betas are now contiguous with q3.
                self.q3.append(&mut self.q2);
                self.delta = Delta::default();
                return Ok(());
            }
            self.delta.start = boundary;
            debug_assert!(self.delta.start < self.delta.end);
            if loaded > 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    fn deliver_msg_status(&mut self, ms: MsgStatus, ack_required: bool) -> Result<Fetched> {
        if ms.index_on_disk && !ms.is_delivered {
            self.index.deliver(ms.seq_id)?;
        }
        let message = ms.msg.clone().expect("queue_out yields alphas");
        let ack_tag = if ack_required {
            Some(if ms.is_persistent {
                AckTag::OnDisk {
                    msg_id: ms.msg_id,
                    seq_id: ms.seq_id,
                }
            } else {
                // A transient receipt carries no disk references, so whatever
                // the message left on disk is cleaned up here and now.
                if ms.msg_on_disk {
                    self.store.remove(&[ms.msg_id]);
                }
                if ms.index_on_disk {
                    self.index.ack(&[ms.seq_id])?;
                }
                AckTag::NotOnDisk { seq_id: ms.seq_id }
            })
        } else {
            if ms.msg_on_disk {
                self.store.remove(&[ms.msg_id]);
            }
            if ms.index_on_disk {
                self.index.ack(&[ms.seq_id])?;
            }
            None
        };
        self.len -= 1;
        self.egress.tick();
        Ok(Fetched {
            message,
            is_delivered: ms.is_delivered,
            ack_tag,
            remaining: self.len,
        })
    }

    /// Shrink RAM residency down to the current target.
    fn reduce_memory_use(&mut self) -> Result<()> {
        let target = match self.target_ram_msg_count {
            Some(t) => t,
            None => return Ok(()),
        };
        if self.ram_msg_count > target {
            let mut quota = self.ram_msg_count - target;
            // q1 tails first.
            while quota > 0 {
                let Some(mut ms) = self.q1.pop_front() else { break };
                self.alpha_to_beta(&mut ms)?;
                if self.delta.count == 0 {
                    self.q3.push_back(ms);
                } else {
                    self.q2.push_back(ms);
                }
                quota -= 1;
            }
            // Then q4, from the young end so q3's front stays the queue head.
            while quota > 0 {
                let Some(mut ms) = self.q4.pop_back() else { break };
                self.alpha_to_beta(&mut ms)?;
                self.q3.push_front(ms);
                quota -= 1;
            }
        }
        if target == 0 {
            self.push_betas_to_deltas()?;
        }
        self.limit_ram_index()?;
        #[cfg(debug_assertions)]
        self.check_invariants();
        Ok(())
    }

    fn push_betas_to_deltas(&mut self) -> Result<()> {
        // All of q2 goes.
        while let Some(mut ms) = self.q2.pop_front() {
            self.beta_to_delta(&mut ms)?;
        }
        // q3 goes from the young end down to, but not into, the segment
        // holding its head, so one segment never mixes residency.
        if let Some(head) = self.q3.front() {
            let limit = self.index.next_segment_boundary(head.seq_id);
            while self.q3.back().map_or(false, |b| b.seq_id >= limit) {
                let mut ms = self.q3.pop_back().expect("checked non-empty");
                self.beta_to_delta(&mut ms)?;
            }
        }
        Ok(())
    }

    fn beta_to_delta(&mut self, ms: &mut MsgStatus) -> Result<()> {
        let wrote = write_index_to_disk(&mut *self.index, true, ms)?;
        if wrote {
            self.ram_index_count -= 1;
        }
        self.extend_delta(ms.seq_id);
        Ok(())
    }

    /// Keep the count of RAM-only index entries under the permitted share.
    fn limit_ram_index(&mut self) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let betas = (self.q2.len() + self.q3.len()) as u64;
        let alphas_betas = self.len - self.delta.count;
        let permitted = if alphas_betas == 0 {
            0
        } else {
            betas.saturating_sub(betas * betas / alphas_betas)
        };
        let reduction = self.ram_index_count.saturating_sub(permitted);
        if reduction < RAM_INDEX_BATCH_SIZE {
            return Ok(());
        }
        let mut remaining = reduction;
        for i in 0..self.q2.len() {
            if remaining == 0 {
                break;
            }
            if !self.q2[i].index_on_disk {
                write_index_to_disk(&mut *self.index, true, &mut self.q2[i])?;
                self.ram_index_count -= 1;
                remaining -= 1;
            }
        }
        for i in 0..self.q3.len() {
            if remaining == 0 {
                break;
            }
            if !self.q3[i].index_on_disk {
                write_index_to_disk(&mut *self.index, true, &mut self.q3[i])?;
                self.ram_index_count -= 1;
                remaining -= 1;
            }
        }
        Ok(())
    }

    fn apply_target(&mut self, new_target: Option<u64>) -> Result<()> {
        self.target_ram_msg_count = new_target;
        if let Some(t) = new_target {
            if t < self.ram_msg_count || t == 0 {
                self.reduce_memory_use()?;
            }
        }
        Ok(())
    }

    fn tx_commit_index(&mut self) -> Result<()> {
        let acks: Vec<AckTag> = self.on_sync.acks.drain(..).flatten().collect();
        let pubs: Vec<Arc<Message>> = self.on_sync.pubs.drain(..).flatten().collect();
        let repliers: Vec<TxReplier> = self.on_sync.repliers.drain(..).collect();
        self.ack_internal(&acks)?;
        let mut synced_seqs = Vec::new();
        for msg in pubs {
            let persistent = msg.is_persistent() && self.durable;
            let on_disk = self.store.contains(msg.id());
            let seq_id = self.publish_internal(msg, false, on_disk)?;
            if persistent {
                synced_seqs.push(seq_id);
            }
        }
        if !synced_seqs.is_empty() {
            self.index.sync(&synced_seqs)?;
        }
        for replier in repliers {
            replier();
        }
        Ok(())
    }

    fn ack_internal(&mut self, tags: &[AckTag]) -> Result<()> {
        let mut remove_ids = Vec::new();
        let mut ack_seqs = Vec::new();
        for tag in tags {
            if let AckTag::OnDisk { msg_id, seq_id } = *tag {
                remove_ids.push(msg_id);
                ack_seqs.push(seq_id);
            }
        }
        if !remove_ids.is_empty() {
            self.store.remove(&remove_ids);
        }
        if !ack_seqs.is_empty() {
            self.index.ack(&ack_seqs)?;
        }
        Ok(())
    }

    /// Asserts the structural invariants. Debug-build call sites only.
    pub fn check_invariants(&self) {
        let stage_total = self.q1.len() as u64
            + self.q2.len() as u64
            + self.delta.count
            + self.q3.len() as u64
            + self.q4.len() as u64;
        assert_eq!(self.len, stage_total, "conservation");
        assert_eq!(
            self.ram_msg_count,
            (self.q1.len() + self.q4.len()) as u64,
            "ram_msg_count tracks alphas"
        );
        if !self.q2.is_empty() {
            assert!(self.delta.count > 0, "q2 requires a delta below it");
        }
        if !self.q1.is_empty() {
            assert!(
                !self.q2.is_empty() || self.delta.count > 0 || !self.q3.is_empty(),
                "q1 requires a non-empty middle"
            );
        }
        if self.len > 0 {
            assert!(
                !self.q3.is_empty() || !self.q4.is_empty(),
                "a non-empty queue is fetchable"
            );
        }
        assert!(self.delta.count <= self.delta.end - self.delta.start);
        for stage in [&self.q1, &self.q2, &self.q3, &self.q4] {
            let mut prev: Option<SeqId> = None;
            for ms in stage {
                if ms.index_on_disk {
                    assert!(ms.msg_on_disk, "index_on_disk implies msg_on_disk");
                }
                if let Some(p) = prev {
                    assert!(p < ms.seq_id, "stages ascend");
                }
                prev = Some(ms.seq_id);
            }
        }
        let upper = |q: &VecDeque<MsgStatus>| q.front().map(|ms| ms.seq_id);
        let lower = |q: &VecDeque<MsgStatus>| q.back().map(|ms| ms.seq_id);
        if let (Some(a), Some(b)) = (lower(&self.q4), upper(&self.q3)) {
            assert!(a < b, "q4 below q3");
        }
        if self.delta.count > 0 {
            if let Some(a) = lower(&self.q3) {
                assert!(a < self.delta.start, "q3 below delta");
            }
            if let Some(b) = upper(&self.q2) {
                assert!(self.delta.end <= b, "delta below q2");
            }
        }
        if let (Some(a), Some(b)) = (lower(&self.q2), upper(&self.q1)) {
            assert!(a < b, "q2 below q1");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_target_ram_msg_count(&mut self, target: Option<u64>) {
        self.target_ram_msg_count = target;
        let _ = self.reduce_memory_use();
    }

    #[cfg(test)]
    pub(crate) fn depths_for_test(&self) -> StageDepths {
        self.status().depths
    }
}

fn write_msg_to_disk(store: &mut dyn MessageStore, force: bool, ms: &mut MsgStatus) -> Result<()> {
    if !ms.msg_on_disk && (force || ms.is_persistent) {
        let msg = ms.msg.as_ref().expect("body present before persisting");
        store.write(msg)?;
        ms.msg_on_disk = true;
    }
    Ok(())
}

/// Returns true when an index entry was written just now.
fn write_index_to_disk(index: &mut dyn QueueIndex, force: bool, ms: &mut MsgStatus) -> Result<bool> {
    if !ms.index_on_disk && (force || ms.is_persistent) {
        debug_assert!(ms.msg_on_disk, "index entries only for on-disk bodies");
        index.publish(ms.seq_id, ms.msg_id, ms.is_persistent)?;
        if ms.is_delivered {
            index.deliver(ms.seq_id)?;
        }
        ms.index_on_disk = true;
        return Ok(true);
    }
    Ok(false)
}

impl BackingQueue for VariableQueue {
    fn publish(&mut self, msg: Arc<Message>) -> Result<SeqId> {
        self.publish_internal(msg, false, false)
    }

    fn publish_delivered(
        &mut self,
        ack_required: bool,
        msg: Arc<Message>,
    ) -> Result<Option<AckTag>> {
        debug_assert_eq!(self.len, 0);
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.ingress.tick();
        self.egress.tick();
        if !ack_required {
            return Ok(None);
        }
        if msg.is_persistent() && self.durable {
            let mut ms = MsgStatus {
                seq_id,
                msg_id: msg.id(),
                is_persistent: true,
                is_delivered: true,
                msg_on_disk: false,
                index_on_disk: false,
                msg: Some(msg),
            };
            write_msg_to_disk(&mut *self.store, true, &mut ms)?;
            write_index_to_disk(&mut *self.index, true, &mut ms)?;
            Ok(Some(AckTag::OnDisk {
                msg_id: ms.msg_id,
                seq_id,
            }))
        } else {
            Ok(Some(AckTag::NotOnDisk { seq_id }))
        }
    }

    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>> {
        match self.queue_out()? {
            None => Ok(None),
            Some(ms) => {
                let fetched = self.deliver_msg_status(ms, ack_required)?;
                #[cfg(debug_assertions)]
                self.check_invariants();
                Ok(Some(fetched))
            }
        }
    }

    fn ack(&mut self, tags: &[AckTag]) -> Result<()> {
        self.ack_internal(tags)
    }

    fn requeue(&mut self, pairs: Vec<(AckTag, Arc<Message>)>) -> Result<()> {
        let mut old_seqs = Vec::new();
        let mut release_ids = Vec::new();
        for (tag, msg) in pairs {
            let msg_on_disk = matches!(tag, AckTag::OnDisk { .. });
            if let AckTag::OnDisk { msg_id, seq_id } = tag {
                old_seqs.push(seq_id);
                release_ids.push(msg_id);
            }
            self.publish_internal(msg, true, msg_on_disk)?;
        }
        if !old_seqs.is_empty() {
            self.index.ack(&old_seqs)?;
        }
        if !release_ids.is_empty() {
            // Keep the bodies, but do not hold now-tail items hot.
            self.store.release(&release_ids);
        }
        Ok(())
    }

    fn dropwhile(&mut self, pred: &mut dyn FnMut(&MessageProps) -> bool) -> Result<u64> {
        let mut dropped = 0;
        loop {
            let Some(ms) = self.queue_out()? else { break };
            let keep = {
                let msg = ms.msg.as_ref().expect("queue_out yields alphas");
                !pred(msg.props())
            };
            if keep {
                self.unget(ms);
                break;
            }
            if ms.msg_on_disk {
                self.store.remove(&[ms.msg_id]);
            }
            if ms.index_on_disk {
                self.index.ack(&[ms.seq_id])?;
            }
            self.len -= 1;
            self.egress.tick();
            dropped += 1;
        }
        #[cfg(debug_assertions)]
        self.check_invariants();
        Ok(dropped)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn purge(&mut self) -> Result<u64> {
        let purged = self.len;
        loop {
            let mut remove_ids = Vec::new();
            let mut ack_seqs = Vec::new();
            for ms in self
                .q4
                .drain(..)
                .chain(self.q3.drain(..))
                .chain(self.q2.drain(..))
                .chain(self.q1.drain(..))
            {
                if ms.msg_on_disk {
                    remove_ids.push(ms.msg_id);
                }
                if ms.index_on_disk {
                    ack_seqs.push(ms.seq_id);
                }
            }
            if !remove_ids.is_empty() {
                self.store.remove(&remove_ids);
            }
            if !ack_seqs.is_empty() {
                self.index.ack(&ack_seqs)?;
            }
            if self.delta.count > 0 {
                self.deltas_to_betas()?;
            } else {
                break;
            }
        }
        self.len = 0;
        self.ram_msg_count = 0;
        self.ram_index_count = 0;
        #[cfg(debug_assertions)]
        self.check_invariants();
        Ok(purged)
    }

    fn delete_and_terminate(&mut self) -> Result<u64> {
        let purged = self.purge()?;
        // Sweep whatever the index still holds (delivered-but-unacked
        // entries), one segment at a time.
        let size = self.index.segment_size();
        let mut seg_start = 0;
        while seg_start < self.next_seq_id {
            let live: Vec<SeqId> = self
                .index
                .read_segment(seg_start)?
                .iter()
                .map(|e| e.seq_id)
                .collect();
            if !live.is_empty() {
                self.index.ack(&live)?;
            }
            seg_start += size;
        }
        self.index.delete_and_terminate()?;
        Ok(purged)
    }

    fn terminate(&mut self) -> Result<()> {
        self.index.flush_journal()
    }

    fn tx_publish(&mut self, txn: TxnId, msg: Arc<Message>) -> Result<()> {
        if msg.is_persistent() && self.durable {
            self.store.write(&msg)?;
        }
        self.txns.entry(txn).or_default().pubs.push(msg);
        Ok(())
    }

    fn tx_ack(&mut self, txn: TxnId, tags: Vec<AckTag>) -> Result<()> {
        self.txns.entry(txn).or_default().acks.extend(tags);
        Ok(())
    }

    fn tx_rollback(&mut self, txn: TxnId) -> Result<Vec<AckTag>> {
        let txn = self.txns.remove(&txn).unwrap_or_default();
        let written: Vec<MessageId> = txn
            .pubs
            .iter()
            .filter(|m| m.is_persistent() && self.durable)
            .map(|m| m.id())
            .collect();
        if !written.is_empty() {
            self.store.remove(&written);
        }
        Ok(txn.acks)
    }

    fn tx_commit(
        &mut self,
        txn: TxnId,
        on_persisted: SyncDone,
        replier: TxReplier,
    ) -> Result<bool> {
        let txn = self.txns.remove(&txn).unwrap_or_default();
        let persistent_ids: Vec<MessageId> = txn
            .pubs
            .iter()
            .filter(|m| m.is_persistent() && self.durable)
            .map(|m| m.id())
            .collect();
        self.on_sync.acks.push(txn.acks);
        self.on_sync.pubs.push(txn.pubs);
        self.on_sync.repliers.push(replier);
        if !persistent_ids.is_empty() {
            self.outstanding_syncs += 1;
            self.store.sync(persistent_ids, on_persisted)?;
            Ok(true)
        } else if self.outstanding_syncs == 0 {
            self.tx_commit_index()?;
            Ok(false)
        } else {
            // Rides the sync already in flight.
            Ok(true)
        }
    }

    fn tx_commit_post_store_sync(&mut self) -> Result<()> {
        self.outstanding_syncs = self.outstanding_syncs.saturating_sub(1);
        if self.outstanding_syncs == 0 && !self.on_sync.is_empty() {
            self.tx_commit_index()?;
        }
        Ok(())
    }

    fn needs_sync(&self) -> bool {
        self.outstanding_syncs > 0 || !self.on_sync.is_empty()
    }

    fn flush_journal(&mut self) -> Result<()> {
        self.index.flush_journal()
    }

    fn status(&self) -> BqStatus {
        BqStatus {
            len: self.len,
            depths: StageDepths {
                q1: self.q1.len(),
                q2: self.q2.len(),
                delta: self.delta.count,
                q3: self.q3.len(),
                q4: self.q4.len(),
            },
            next_seq_id: self.next_seq_id,
            ram_msg_count: self.ram_msg_count,
            ram_index_count: self.ram_index_count,
            target_ram_msg_count: self.target_ram_msg_count,
            avg_ingress_rate: self.ingress.avg,
            avg_egress_rate: self.egress.avg,
        }
    }

    fn ram_duration(&mut self) -> f64 {
        let now = Instant::now();
        self.ingress.remeasure(now);
        self.egress.remeasure(now);
        let rate = self.ingress.avg + self.egress.avg;
        if rate == 0.0 {
            f64::INFINITY
        } else {
            self.ram_msg_count as f64 / rate
        }
    }

    fn set_ram_duration_target(&mut self, duration_s: Option<f64>) -> Result<()> {
        self.duration_target = duration_s;
        let new_target = duration_s
            .map(|secs| ((self.ingress.avg + self.egress.avg) * secs).trunc() as u64);
        self.apply_target(new_target)
    }

    fn update_ram_duration(&mut self) -> Result<()> {
        let now = Instant::now();
        self.ingress.remeasure(now);
        self.egress.remeasure(now);
        let new_target = self
            .duration_target
            .map(|secs| ((self.ingress.avg + self.egress.avg) * secs).trunc() as u64);
        self.apply_target(new_target)
    }

    fn is_duplicate(&self, _msg: &Message) -> bool {
        false
    }

    fn discard(&mut self, _msg: Arc<Message>) -> Result<()> {
        Ok(())
    }

    fn invoke(&mut self, op: BqOp) {
        op(self);
    }

    fn needs_timeout(&self) -> TimeoutNeed {
        if self.needs_sync() {
            TimeoutNeed::Timed
        } else if self.index.needs_flush() {
            TimeoutNeed::Idle
        } else {
            TimeoutNeed::False
        }
    }

    fn handle_pre_hibernate(&mut self) -> Result<()> {
        self.index.flush_journal()
    }

    fn drain_confirmed(&mut self) -> Vec<MessageId> {
        self.store.drain_confirmed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::MemIndex;
    use crate::core::store::MemStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SEG: u64 = 16;

    fn vq(durable: bool) -> (VariableQueue, MemStore) {
        let store = MemStore::new();
        let q = VariableQueue::new(
            Box::new(store.clone()),
            Box::new(MemIndex::new(SEG)),
            durable,
            None,
        );
        (q, store)
    }

    fn msg(n: usize, persistent: bool) -> Arc<Message> {
        Arc::new(Message::new(format!("payload-{n}"), persistent))
    }

    fn publish_n(q: &mut VariableQueue, n: usize, persistent: bool) -> Vec<Arc<Message>> {
        (0..n)
            .map(|i| {
                let m = msg(i, persistent);
                q.publish(Arc::clone(&m)).unwrap();
                m
            })
            .collect()
    }

    fn drain_all(q: &mut VariableQueue) -> Vec<Fetched> {
        let mut out = Vec::new();
        while let Some(f) = q.fetch(false).unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn fifo_without_memory_pressure() {
        let (mut q, _) = vq(false);
        let msgs = publish_n(&mut q, 50, false);
        assert_eq!(q.len(), 50);
        assert_eq!(q.depths_for_test().q4, 50);
        let fetched = drain_all(&mut q);
        assert_eq!(fetched.len(), 50);
        for (f, m) in fetched.iter().zip(&msgs) {
            assert_eq!(f.message.id(), m.id());
        }
        assert!(q.is_empty());
        q.check_invariants();
    }

    #[test]
    fn at_target_boundary_next_publish_is_not_an_alpha() {
        let (mut q, _) = vq(false);
        publish_n(&mut q, 4, false);
        q.set_target_ram_msg_count(Some(4));
        assert_eq!(q.status().ram_msg_count, 4);
        // Exactly at the target: the next message must not enter RAM.
        q.publish(msg(99, false)).unwrap();
        assert_eq!(q.status().ram_msg_count, 4);
        assert_eq!(q.depths_for_test().q3, 1);
    }

    #[test]
    fn target_zero_migrates_to_delta_and_preserves_order() {
        let (mut q, store) = vq(false);
        let msgs = publish_n(&mut q, 100, false);
        assert_eq!(q.depths_for_test().q4, 100);

        q.set_target_ram_msg_count(Some(0));
        let depths = q.depths_for_test();
        assert_eq!(q.status().ram_msg_count, 0);
        assert_eq!(depths.q1, 0);
        assert_eq!(depths.q4, 0);
        // Everything above q3's head segment moved wholly to disk.
        assert_eq!(depths.q3 as u64, SEG);
        assert_eq!(depths.delta, 100 - SEG);
        assert!(store.len() == 100, "all bodies persisted");

        let fetched = drain_all(&mut q);
        assert_eq!(fetched.len(), 100);
        for (f, m) in fetched.iter().zip(&msgs) {
            assert_eq!(f.message.id(), m.id());
            assert_eq!(f.message.payload(), m.payload());
        }
        q.check_invariants();
    }

    #[test]
    fn budget_zero_publishes_cross_segment_boundary_into_delta() {
        let (mut q, _) = vq(false);
        q.set_target_ram_msg_count(Some(0));
        // First segment's worth lands in q3 as betas.
        for i in 0..SEG as usize {
            q.publish(msg(i, false)).unwrap();
        }
        let depths = q.depths_for_test();
        assert_eq!(depths.q3 as u64, SEG);
        assert_eq!(depths.delta, 0);
        // The first publish past the boundary goes straight to delta.
        q.publish(msg(999, false)).unwrap();
        let depths = q.depths_for_test();
        assert_eq!(depths.q3 as u64, SEG);
        assert_eq!(depths.delta, 1);
        q.check_invariants();
    }

    #[test]
    fn growing_the_target_back_lets_messages_return_to_ram() {
        let (mut q, _) = vq(false);
        publish_n(&mut q, 60, false);
        q.set_target_ram_msg_count(Some(0));
        assert_eq!(q.status().ram_msg_count, 0);
        q.set_target_ram_msg_count(None);
        // Migration back is lazy: draining reloads every body in order.
        let fetched = drain_all(&mut q);
        assert_eq!(fetched.len(), 60);
        q.check_invariants();
    }

    #[test]
    fn fetch_with_ack_keeps_persistent_bodies_until_acked() {
        let (mut q, store) = vq(true);
        let m = msg(0, true);
        q.publish(Arc::clone(&m)).unwrap();
        let f = q.fetch(true).unwrap().unwrap();
        let tag = f.ack_tag.unwrap();
        assert!(matches!(tag, AckTag::OnDisk { .. }));
        assert!(store.contains(m.id()), "body survives until the ack");
        q.ack(&[tag]).unwrap();
        assert!(!store.contains(m.id()));
    }

    #[test]
    fn fetch_without_ack_is_terminal() {
        let (mut q, store) = vq(true);
        let m = msg(0, true);
        q.publish(Arc::clone(&m)).unwrap();
        let f = q.fetch(false).unwrap().unwrap();
        assert!(f.ack_tag.is_none());
        assert!(!store.contains(m.id()));
        assert!(q.is_empty());
    }

    #[test]
    fn transient_spilled_body_is_removed_at_delivery() {
        let (mut q, store) = vq(false);
        let msgs = publish_n(&mut q, 20, false);
        q.set_target_ram_msg_count(Some(0));
        assert!(store.contains(msgs[0].id()));
        let f = q.fetch(true).unwrap().unwrap();
        // Transient message that had been pushed to disk: removed on
        // delivery, receipt says so.
        assert!(matches!(f.ack_tag, Some(AckTag::NotOnDisk { .. })));
        assert!(!store.contains(msgs[0].id()));
    }

    #[test]
    fn requeue_then_ack_equals_plain_ack() {
        let (mut q, store) = vq(true);
        let msgs = publish_n(&mut q, 3, true);
        let mut pairs = Vec::new();
        for _ in 0..3 {
            let f = q.fetch(true).unwrap().unwrap();
            pairs.push((f.ack_tag.unwrap(), f.message));
        }
        assert_eq!(q.len(), 0);
        q.requeue(pairs).unwrap();
        assert_eq!(q.len(), 3);

        // Round two: same messages, same relative order, delivered flag set.
        let mut tags = Vec::new();
        for m in &msgs {
            let f = q.fetch(true).unwrap().unwrap();
            assert_eq!(f.message.id(), m.id());
            assert!(f.is_delivered);
            tags.push(f.ack_tag.unwrap());
        }
        q.ack(&tags).unwrap();
        for m in &msgs {
            assert!(!store.contains(m.id()));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn purge_is_idempotent_and_clears_counts() {
        let (mut q, store) = vq(false);
        publish_n(&mut q, 40, false);
        q.set_target_ram_msg_count(Some(0));
        assert_eq!(q.purge().unwrap(), 40);
        let st = q.status();
        assert_eq!(st.len, 0);
        assert_eq!(st.ram_msg_count, 0);
        assert_eq!(st.ram_index_count, 0);
        assert!(store.is_empty());
        assert_eq!(q.purge().unwrap(), 0);
    }

    #[test]
    fn dropwhile_drops_expired_heads_only() {
        let (mut q, _) = vq(false);
        for i in 0..3 {
            let m = Message::with_props(
                format!("old-{i}"),
                false,
                MessageProps { expiry_us: Some(100) },
            );
            q.publish(Arc::new(m)).unwrap();
        }
        let fresh = Arc::new(Message::with_props(
            "fresh",
            false,
            MessageProps {
                expiry_us: Some(u64::MAX),
            },
        ));
        q.publish(Arc::clone(&fresh)).unwrap();

        let now = 1_000;
        let dropped = q
            .dropwhile(&mut |props: &MessageProps| {
                matches!(props.expiry_us, Some(at) if at <= now)
            })
            .unwrap();
        assert_eq!(dropped, 3);
        assert_eq!(q.len(), 1);
        let f = q.fetch(false).unwrap().unwrap();
        assert_eq!(f.message.id(), fresh.id());
    }

    #[test]
    fn tx_commit_without_persistent_pubs_is_immediate() {
        let (mut q, _) = vq(false);
        let txn = TxnId(1);
        q.tx_publish(txn, msg(0, false)).unwrap();
        q.tx_publish(txn, msg(1, false)).unwrap();
        let replied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&replied);
        let deferred = q
            .tx_commit(txn, Box::new(|| {}), Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(!deferred);
        assert!(replied.load(Ordering::SeqCst));
        assert!(!q.needs_sync());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn tx_commit_with_persistent_pubs_waits_for_the_store() {
        let (mut q, store) = vq(true);
        store.defer_syncs();
        let txn = TxnId(7);
        for i in 0..10 {
            q.tx_publish(txn, msg(i, true)).unwrap();
        }
        let replied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&replied);
        let deferred = q
            .tx_commit(txn, Box::new(|| {}), Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(deferred);
        assert!(q.needs_sync());
        assert_eq!(q.len(), 0, "pubs are fenced until the sync lands");
        assert!(!replied.load(Ordering::SeqCst));

        store.complete_syncs();
        q.tx_commit_post_store_sync().unwrap();
        assert!(!q.needs_sync());
        assert!(replied.load(Ordering::SeqCst));
        assert_eq!(q.len(), 10);
        let fetched = drain_all(&mut q);
        assert_eq!(fetched.len(), 10);
    }

    #[test]
    fn tx_rollback_leaves_no_trace() {
        let (mut q, store) = vq(true);
        let txn = TxnId(3);
        let m = msg(0, true);
        q.tx_publish(txn, Arc::clone(&m)).unwrap();
        let acks = q.tx_rollback(txn).unwrap();
        assert!(acks.is_empty());
        assert_eq!(q.len(), 0);
        assert!(!store.contains(m.id()));
        assert!(!q.needs_sync());
        q.check_invariants();
    }

    #[test]
    fn tx_ack_applies_on_commit() {
        let (mut q, store) = vq(true);
        let m = msg(0, true);
        q.publish(Arc::clone(&m)).unwrap();
        let f = q.fetch(true).unwrap().unwrap();
        let txn = TxnId(5);
        q.tx_ack(txn, vec![f.ack_tag.unwrap()]).unwrap();
        assert!(store.contains(m.id()));
        q.tx_commit(txn, Box::new(|| {}), Box::new(|| {})).unwrap();
        assert!(!store.contains(m.id()));
    }

    #[test]
    fn publish_delivered_returns_a_usable_tag() {
        let (mut q, store) = vq(true);
        let m = msg(0, true);
        let tag = q.publish_delivered(true, Arc::clone(&m)).unwrap().unwrap();
        assert!(matches!(tag, AckTag::OnDisk { .. }));
        assert!(store.contains(m.id()));
        q.ack(&[tag]).unwrap();
        assert!(!store.contains(m.id()));
        assert!(q.publish_delivered(false, msg(1, false)).unwrap().is_none());
    }

    #[test]
    fn delete_and_terminate_erases_the_index() {
        let (mut q, _) = vq(true);
        publish_n(&mut q, 5, true);
        // One delivered-but-unacked entry survives the purge and must be
        // swept by delete.
        let _f = q.fetch(true).unwrap().unwrap();
        let purged = q.delete_and_terminate().unwrap();
        assert_eq!(purged, 4);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn ram_index_count_is_limited_in_batches() {
        let (mut q, _) = vq(false);
        publish_n(&mut q, 256, false);
        q.set_target_ram_msg_count(Some(0));
        // Everything is a beta or delta now; the permitted share of
        // RAM-resident index entries collapses and gets flushed in batches.
        assert!(q.status().ram_index_count < 256);
        q.check_invariants();
    }

    #[test]
    fn rate_estimator_averages_over_two_intervals() {
        let t0 = Instant::now();
        let mut est = RateEstimator::new(t0);
        for _ in 0..100 {
            est.tick();
        }
        let t1 = t0 + Duration::from_secs(1);
        est.remeasure(t1);
        // 100 msgs over one second.
        assert!((est.avg - 100.0).abs() < 1.0);
        for _ in 0..300 {
            est.tick();
        }
        let t2 = t1 + Duration::from_secs(1);
        est.remeasure(t2);
        // (300 + 100) over the two seconds since the older mark.
        assert!((est.avg - 200.0).abs() < 1.0);
    }
}

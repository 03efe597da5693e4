//! Consumer rosters, link-credit records and per-channel side state for the
//! queue actor.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::core::backing_queue::AckTag;
use crate::core::limiter::LimiterToken;
use crate::core::message::Message;
use crate::core::serial;
use crate::core::{ChannelId, SeqId};

use super::ChannelHandle;

/// Unique within a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerTag(pub String);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct Consumer {
    pub channel: ChannelId,
    pub tag: ConsumerTag,
    pub ack_required: bool,
    pub token: LimiterToken,
}

/// AMQP 1.0-style link credit for one consumer. The count is a serial
/// number over a window; comparisons go through `serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditRecord {
    pub credit: u64,
    pub count: u32,
    pub drain: bool,
}

impl CreditRecord {
    pub fn credit_left(&self) -> bool {
        self.credit > 0
    }

    /// Consume one credit. In drain mode, emptying the queue burns whatever
    /// credit remains, advancing the count by the same amount.
    pub fn decr(&mut self, len_after: u64) {
        self.credit = self.credit.saturating_sub(1);
        self.count = serial::add(self.count, 1);
        if self.drain && len_after == 0 && self.credit > 0 {
            self.count = serial::add(self.count, self.credit as u32);
            self.credit = 0;
        }
    }
}

/// Per-consumer credit map. Consumers without a record are unlimited.
#[derive(Default)]
pub struct CreditMap {
    map: HashMap<ConsumerTag, CreditRecord>,
}

impl CreditMap {
    pub fn credit_left(&self, tag: &ConsumerTag) -> bool {
        self.map.get(tag).map_or(true, CreditRecord::credit_left)
    }

    pub fn get(&self, tag: &ConsumerTag) -> Option<CreditRecord> {
        self.map.get(tag).copied()
    }

    /// Consume one credit after a delivery; `None` for unlimited consumers.
    pub fn decr(&mut self, tag: &ConsumerTag, len_after: u64) -> Option<CreditRecord> {
        let rec = self.map.get_mut(tag)?;
        rec.decr(len_after);
        Some(*rec)
    }

    pub fn insert(&mut self, tag: ConsumerTag, rec: CreditRecord) {
        self.map.insert(tag, rec);
    }

    /// Rebase from a channel's `(credit, count, drain)` announcement: the
    /// channel grants `credit` as of its own `count`, which may trail ours.
    /// Returns the effective record and whether credit went zero → positive.
    pub fn update(
        &mut self,
        tag: &ConsumerTag,
        credit: u64,
        count: u32,
        drain: bool,
    ) -> (CreditRecord, bool) {
        let had_credit = self.credit_left(tag) && self.map.contains_key(tag);
        let local_count = self.map.get(tag).map_or(count, |r| r.count);
        let consumed = serial::diff(local_count, count).max(0) as u64;
        let rec = CreditRecord {
            credit: credit.saturating_sub(consumed),
            count: local_count,
            drain,
        };
        self.map.insert(tag.clone(), rec);
        let woke = !had_credit && rec.credit_left();
        (rec, woke)
    }

    pub fn remove(&mut self, tag: &ConsumerTag) {
        self.map.remove(tag);
    }
}

/// FIFO rosters of deliverable and parked consumers.
///
/// The active roster never holds a consumer of a blocked channel; the
/// blocked roster may hold either kind.
#[derive(Default)]
pub struct Rosters {
    active: VecDeque<Consumer>,
    blocked: VecDeque<Consumer>,
}

impl Rosters {
    pub fn pop_active(&mut self) -> Option<Consumer> {
        self.active.pop_front()
    }

    pub fn push_active(&mut self, c: Consumer) {
        self.active.push_back(c);
    }

    pub fn push_blocked(&mut self, c: Consumer) {
        self.blocked.push_back(c);
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn total(&self) -> usize {
        self.active.len() + self.blocked.len()
    }

    /// Park every active consumer of `channel`.
    pub fn block_channel(&mut self, channel: ChannelId) {
        let mut kept = VecDeque::with_capacity(self.active.len());
        for c in self.active.drain(..) {
            if c.channel == channel {
                self.blocked.push_back(c);
            } else {
                kept.push_back(c);
            }
        }
        self.active = kept;
    }

    /// Return `channel`'s parked consumers to the active roster, except those
    /// `keep_parked` says to hold back (e.g. zero link credit).
    pub fn unblock_channel(&mut self, channel: ChannelId, keep_parked: impl Fn(&Consumer) -> bool) {
        let mut kept = VecDeque::with_capacity(self.blocked.len());
        for c in self.blocked.drain(..) {
            if c.channel == channel && !keep_parked(&c) {
                self.active.push_back(c);
            } else {
                kept.push_back(c);
            }
        }
        self.blocked = kept;
    }

    /// Move one parked consumer back (link credit came back).
    pub fn promote(&mut self, tag: &ConsumerTag) {
        if let Some(pos) = self.blocked.iter().position(|c| &c.tag == tag) {
            let c = self.blocked.remove(pos).expect("position just found");
            self.active.push_back(c);
        }
    }

    pub fn remove_tag(&mut self, tag: &ConsumerTag) -> Option<Consumer> {
        if let Some(pos) = self.active.iter().position(|c| &c.tag == tag) {
            return self.active.remove(pos);
        }
        if let Some(pos) = self.blocked.iter().position(|c| &c.tag == tag) {
            return self.blocked.remove(pos);
        }
        None
    }

    pub fn remove_channel(&mut self, channel: ChannelId) -> Vec<Consumer> {
        let mut removed = Vec::new();
        self.active.retain(|c| {
            if c.channel == channel {
                removed.push(c.clone());
                false
            } else {
                true
            }
        });
        self.blocked.retain(|c| {
            if c.channel == channel {
                removed.push(c.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn is_parked(&self, tag: &ConsumerTag) -> bool {
        self.blocked.iter().any(|c| &c.tag == tag)
    }

    pub fn find_channel(&self, tag: &ConsumerTag) -> Option<ChannelId> {
        self.active
            .iter()
            .chain(self.blocked.iter())
            .find(|c| &c.tag == tag)
            .map(|c| c.channel)
    }
}

/// A delivery awaiting acknowledgement.
pub struct Unacked {
    pub tag: AckTag,
    pub msg: Arc<Message>,
    pub consumer_tag: ConsumerTag,
}

/// Side state per channel subscribed to this queue.
pub struct ChannelRecord {
    pub handle: ChannelHandle,
    pub consumer_count: usize,
    /// Outstanding ack-requiring deliveries, in seq order.
    pub unacked: BTreeMap<SeqId, Unacked>,
    pub token: LimiterToken,
    /// The limiter refused this channel; consumers parked until it notifies.
    pub limit_active: bool,
    /// Deliveries in flight, for prefetch backpressure.
    pub unsent: u32,
}

impl ChannelRecord {
    pub fn new(handle: ChannelHandle, token: LimiterToken) -> Self {
        ChannelRecord {
            handle,
            consumer_count: 0,
            unacked: BTreeMap::new(),
            token,
            limit_active: false,
            unsent: 0,
        }
    }

    /// A record is kept alive by consumers, unacked deliveries or in-flight
    /// sends; when all three drain it can go.
    pub fn is_dead(&self) -> bool {
        self.consumer_count == 0 && self.unacked.is_empty() && self.unsent == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> ConsumerTag {
        ConsumerTag(s.to_string())
    }

    #[test]
    fn credit_decrements_and_drains_to_zero() {
        let mut rec = CreditRecord {
            credit: 3,
            count: 7,
            drain: false,
        };
        rec.decr(5);
        assert_eq!(rec.credit, 2);
        assert_eq!(rec.count, 8);

        // Drain mode: emptying the queue burns the rest of the credit.
        let mut rec = CreditRecord {
            credit: 5,
            count: 0,
            drain: true,
        };
        rec.decr(0);
        assert_eq!(rec.credit, 0);
        assert_eq!(rec.count, 5);
    }

    #[test]
    fn update_rebases_against_consumed_credit() {
        let mut map = CreditMap::default();
        map.insert(
            tag("c"),
            CreditRecord {
                credit: 0,
                count: 10,
                drain: false,
            },
        );
        // Channel grants 4 as of count 8; we have already used 2 of those.
        let (rec, woke) = map.update(&tag("c"), 4, 8, false);
        assert_eq!(rec.credit, 2);
        assert_eq!(rec.count, 10);
        assert!(woke);
    }

    #[test]
    fn update_handles_count_wraparound() {
        let mut map = CreditMap::default();
        map.insert(
            tag("c"),
            CreditRecord {
                credit: 0,
                count: 1,
                drain: false,
            },
        );
        let (rec, _) = map.update(&tag("c"), 10, u32::MAX - 1, false);
        assert_eq!(rec.credit, 7);
    }

    #[test]
    fn rosters_move_channels_wholesale() {
        let mut rosters = Rosters::default();
        for (i, ch) in [(0, 1u64), (1, 2), (2, 1)] {
            rosters.push_active(Consumer {
                channel: ChannelId(ch),
                tag: tag(&format!("c{i}")),
                ack_required: true,
                token: LimiterToken::disabled(),
            });
        }
        rosters.block_channel(ChannelId(1));
        assert_eq!(rosters.total(), 3);
        assert_eq!(rosters.pop_active().unwrap().tag, tag("c1"));
        assert!(!rosters.has_active());
        rosters.unblock_channel(ChannelId(1), |_| false);
        assert_eq!(rosters.pop_active().unwrap().tag, tag("c0"));
        assert_eq!(rosters.pop_active().unwrap().tag, tag("c2"));
    }

    #[test]
    fn unblock_can_hold_back_creditless_consumers() {
        let mut rosters = Rosters::default();
        rosters.push_blocked(Consumer {
            channel: ChannelId(1),
            tag: tag("broke"),
            ack_required: true,
            token: LimiterToken::disabled(),
        });
        rosters.unblock_channel(ChannelId(1), |c| c.tag == tag("broke"));
        assert!(!rosters.has_active());
        assert!(rosters.is_parked(&tag("broke")));
        rosters.promote(&tag("broke"));
        assert!(rosters.has_active());
    }
}

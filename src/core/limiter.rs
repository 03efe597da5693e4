//! Per-channel prefetch limiter.
//!
//! One limiter serves every consumer a channel hosts, across all the queues
//! the channel consumes from. It tracks the channel's in-flight ack-requiring
//! volume against the prefetch cap, plus a channel-wide blocked override, and
//! remembers which queues it refused so it can notify them on the transition
//! back to open. Consumers hold a small token that short-circuits to
//! "permitted" when the limiter is disabled or gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{ChannelId, QueueId};

/// Result of `set_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    Active,
    /// The new prefetch count is zero; callers should stop routing through
    /// the limiter.
    Disabled,
}

struct QueueEntry {
    unblock: mpsc::UnboundedSender<ChannelId>,
    needs_notify: bool,
}

struct LimiterState {
    prefetch_count: usize,
    /// In-flight ack-requiring deliveries.
    volume: usize,
    /// Channel-wide flow-control override.
    blocked: bool,
    queues: HashMap<QueueId, QueueEntry>,
}

impl LimiterState {
    fn is_open(&self) -> bool {
        !self.blocked && !(self.prefetch_count > 0 && self.volume >= self.prefetch_count)
    }
}

pub struct Limiter {
    channel: ChannelId,
    state: Mutex<LimiterState>,
}

impl Limiter {
    pub fn new(channel: ChannelId, prefetch_count: usize) -> Arc<Self> {
        Arc::new(Limiter {
            channel,
            state: Mutex::new(LimiterState {
                prefetch_count,
                volume: 0,
                blocked: false,
                queues: HashMap::new(),
            }),
        })
    }

    /// Token for a consumer. `enabled == false` short-circuits everything.
    pub fn token(self: &Arc<Self>) -> LimiterToken {
        LimiterToken {
            limiter: Some(Arc::downgrade(self)),
            enabled: true,
        }
    }

    pub fn register(&self, queue: QueueId, unblock: mpsc::UnboundedSender<ChannelId>) {
        self.state.lock().queues.insert(
            queue,
            QueueEntry {
                unblock,
                needs_notify: false,
            },
        );
    }

    pub fn unregister(&self, queue: QueueId) {
        self.state.lock().queues.remove(&queue);
    }

    /// May `queue` send one delivery? On refusal the queue is remembered for
    /// the next unblock notification.
    pub fn can_send(&self, queue: QueueId, ack_required: bool) -> bool {
        let mut st = self.state.lock();
        if !st.is_open() {
            if let Some(entry) = st.queues.get_mut(&queue) {
                entry.needs_notify = true;
            }
            return false;
        }
        if ack_required {
            st.volume += 1;
        }
        true
    }

    /// The channel finished handling `count` deliveries.
    pub fn ack(&self, count: usize) {
        self.transition(|st| st.volume = st.volume.saturating_sub(count));
    }

    pub fn block(&self) {
        self.transition(|st| st.blocked = true);
    }

    pub fn unblock(&self) {
        self.transition(|st| st.blocked = false);
    }

    pub fn set_limit(&self, prefetch_count: usize) -> LimitOutcome {
        self.transition(|st| st.prefetch_count = prefetch_count);
        if prefetch_count == 0 {
            LimitOutcome::Disabled
        } else {
            LimitOutcome::Active
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn get_limit(&self) -> usize {
        self.state.lock().prefetch_count
    }

    /// Apply `f`, then notify waiting queues if the limiter transitioned from
    /// closed to open. Visit order is randomised so no queue is starved.
    fn transition(&self, f: impl FnOnce(&mut LimiterState)) {
        let mut st = self.state.lock();
        let was_open = st.is_open();
        f(&mut st);
        if was_open || !st.is_open() {
            return;
        }
        let mut waiting: Vec<QueueId> = st
            .queues
            .iter()
            .filter(|(_, e)| e.needs_notify)
            .map(|(&q, _)| q)
            .collect();
        waiting.shuffle(&mut rand::thread_rng());
        debug!(channel = self.channel.0, queues = waiting.len(), "limiter opened");
        for q in waiting {
            if let Some(entry) = st.queues.get_mut(&q) {
                entry.needs_notify = false;
                let _ = entry.unblock.send(self.channel);
            }
        }
    }
}

/// Small handle held by consumers. All methods substitute the permissive
/// default when the token is disabled or the limiter has gone away.
#[derive(Clone, Default)]
pub struct LimiterToken {
    limiter: Option<Weak<Limiter>>,
    pub enabled: bool,
}

impl LimiterToken {
    pub fn disabled() -> Self {
        LimiterToken {
            limiter: None,
            enabled: false,
        }
    }

    fn with<T>(&self, default: T, f: impl FnOnce(&Limiter) -> T) -> T {
        if !self.enabled {
            return default;
        }
        match self.limiter.as_ref().and_then(Weak::upgrade) {
            Some(lim) => f(&lim),
            None => default,
        }
    }

    pub fn can_send(&self, queue: QueueId, ack_required: bool) -> bool {
        self.with(true, |lim| lim.can_send(queue, ack_required))
    }

    pub fn ack(&self, count: usize) {
        self.with((), |lim| lim.ack(count));
    }

    pub fn is_blocked(&self) -> bool {
        self.with(false, |lim| lim.is_blocked())
    }

    pub fn register(&self, queue: QueueId, unblock: mpsc::UnboundedSender<ChannelId>) {
        self.with((), |lim| lim.register(queue, unblock));
    }

    pub fn unregister(&self, queue: QueueId) {
        self.with((), |lim| lim.unregister(queue));
    }
}

//! Inter-actor backpressure ledger.
//!
//! Each actor keeps one `CreditFlow` over the peers it exchanges messages
//! with. Sending toward a peer spends credit that peer granted us; processing
//! a message from a peer eventually earns the peer a fresh grant. Grants are
//! returned to the caller as `Grant` values rather than delivered in place,
//! so the owning actor decides how they travel.
//!
//! Grants are one-directionally coupled to being unblocked: while this actor
//! is itself blocked on some downstream peer, grants it owes are deferred and
//! only flushed once the block clears. An overloaded intermediary therefore
//! cannot issue credit faster than it drains.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

pub const MAX_CREDIT: i64 = 200;
pub const MORE_CREDIT_AT: i64 = 150;

/// A credit bump owed to `peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant<P> {
    pub peer: P,
    pub bump: u32,
}

#[derive(Debug, Default)]
pub struct CreditFlow<P: Eq + Hash + Copy> {
    /// Credit each peer has granted us for sending toward it.
    credit_from: HashMap<P, i64>,
    /// Credit we have granted each peer sending toward us.
    credit_to: HashMap<P, i64>,
    /// Peers that have driven us to zero credit.
    blocked: HashSet<P>,
    /// Grants held back while we are ourselves blocked.
    deferred: Vec<Grant<P>>,
}

impl<P: Eq + Hash + Copy> CreditFlow<P> {
    pub fn new() -> Self {
        CreditFlow {
            credit_from: HashMap::new(),
            credit_to: HashMap::new(),
            blocked: HashSet::new(),
            deferred: Vec::new(),
        }
    }

    /// Record one message sent toward `to`, spending a unit of its grant.
    pub fn send(&mut self, to: P) {
        let credit = self.credit_from.entry(to).or_insert(MAX_CREDIT);
        *credit -= 1;
        if *credit <= 0 {
            self.blocked.insert(to);
        }
    }

    /// Record one message from `from` as processed. May yield a grant.
    pub fn ack(&mut self, from: P) -> Vec<Grant<P>> {
        let credit = self.credit_to.entry(from).or_insert(MAX_CREDIT);
        *credit -= 1;
        if *credit < MORE_CREDIT_AT {
            *credit = MAX_CREDIT;
            let grant = Grant {
                peer: from,
                bump: (MAX_CREDIT - MORE_CREDIT_AT) as u32,
            };
            return self.issue(grant);
        }
        Vec::new()
    }

    /// Apply a bump received from `from`. May flush deferred grants if the
    /// bump cleared our last block.
    pub fn handle_bump(&mut self, from: P, bump: u32) -> Vec<Grant<P>> {
        let credit = self.credit_from.entry(from).or_insert(0);
        *credit += bump as i64;
        if *credit > 0 {
            self.blocked.remove(&from);
        }
        self.maybe_flush()
    }

    /// Forget a peer entirely. Idempotent; may flush deferred grants if the
    /// peer was our last block.
    pub fn peer_down(&mut self, peer: P) -> Vec<Grant<P>> {
        self.credit_from.remove(&peer);
        self.credit_to.remove(&peer);
        self.blocked.remove(&peer);
        self.deferred.retain(|g| g.peer != peer);
        self.maybe_flush()
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    fn issue(&mut self, grant: Grant<P>) -> Vec<Grant<P>> {
        if self.is_blocked() {
            self.deferred.push(grant);
            Vec::new()
        } else {
            vec![grant]
        }
    }

    fn maybe_flush(&mut self) -> Vec<Grant<P>> {
        if self.is_blocked() {
            Vec::new()
        } else {
            std::mem::take(&mut self.deferred)
        }
    }

    #[cfg(test)]
    fn credit_from(&self, peer: P) -> Option<i64> {
        self.credit_from.get(&peer).copied()
    }
}

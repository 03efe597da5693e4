//! Delegate fan-out: run one operation against many target actors, batched
//! per owning node.
//!
//! Targets on the local node are invoked inline, preserving effect ordering
//! with the caller's subsequent sends. Targets on each remote node travel as
//! one batched job to a worker picked by hashing the caller's identity over
//! a small CPU-multiple pool; the pick is memoised per target node. A failing
//! target never aborts its peers; its panic surfaces in the result row.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::core::NodeId;

/// Workers per node: a small multiple of the CPU count.
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

/// Anything the delegate can address: it only needs to know the owning node.
pub trait Addressable {
    fn node(&self) -> NodeId;
}

#[derive(Debug)]
pub enum CallStatus {
    Ok,
    Error(String),
}

pub struct CallResult<T, R> {
    pub target: T,
    pub status: CallStatus,
    pub result: Option<R>,
}

type Job = Box<dyn FnOnce() + Send>;

pub struct Delegate {
    pool_size: usize,
    workers: DashMap<NodeId, Vec<mpsc::UnboundedSender<Job>>>,
    /// caller identity -> memoised worker pick per node.
    memo: Mutex<HashMap<(u64, NodeId), usize>>,
}

impl Delegate {
    pub fn new() -> Self {
        Self::with_pool_size(default_pool_size())
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Delegate {
            pool_size: pool_size.max(1),
            workers: DashMap::new(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn worker_for(&self, caller: u64, node: NodeId) -> mpsc::UnboundedSender<Job> {
        let pool = self.workers.entry(node).or_insert_with(|| {
            (0..self.pool_size)
                .map(|_| {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                    tokio::spawn(async move {
                        while let Some(job) = rx.recv().await {
                            job();
                        }
                    });
                    tx
                })
                .collect()
        });
        let slot = *self
            .memo
            .lock()
            .entry((caller, node))
            .or_insert_with(|| {
                let mut hasher = DefaultHasher::new();
                caller.hash(&mut hasher);
                (hasher.finish() as usize) % self.pool_size
            });
        pool[slot].clone()
    }

    /// Apply `f` to every target, gathering `(target, status, result)` rows.
    pub async fn invoke<T, R>(
        &self,
        caller: u64,
        targets: Vec<T>,
        f: Arc<dyn Fn(&T) -> R + Send + Sync>,
    ) -> Vec<CallResult<T, R>>
    where
        T: Addressable + Send + 'static,
        R: Send + 'static,
    {
        let mut by_node: HashMap<NodeId, Vec<T>> = HashMap::new();
        for t in targets {
            by_node.entry(t.node()).or_default().push(t);
        }

        let mut results = Vec::new();

        // Local targets run inline so effect ordering is preserved with
        // whatever the caller sends next.
        if let Some(local) = by_node.remove(&NodeId::LOCAL) {
            results.extend(apply_batch(&local_f(&f), local));
        }

        let mut gathers = Vec::new();
        for (node, batch) in by_node {
            let worker = self.worker_for(caller, node);
            let (reply_tx, reply_rx) = oneshot::channel();
            let f = Arc::clone(&f);
            let job: Job = Box::new(move || {
                let rows = apply_batch(&move |t: &T| f(t), batch);
                let _ = reply_tx.send(rows);
            });
            if worker.send(job).is_err() {
                warn!(node = node.0, "delegate worker gone");
                continue;
            }
            gathers.push(reply_rx);
        }
        for rx in gathers {
            if let Ok(rows) = rx.await {
                results.extend(rows);
            }
        }
        results
    }

    /// Same grouping, no reply gathering.
    pub fn invoke_no_result<T>(
        &self,
        caller: u64,
        targets: Vec<T>,
        f: Arc<dyn Fn(&T) + Send + Sync>,
    ) where
        T: Addressable + Send + 'static,
    {
        let mut by_node: HashMap<NodeId, Vec<T>> = HashMap::new();
        for t in targets {
            by_node.entry(t.node()).or_default().push(t);
        }
        if let Some(local) = by_node.remove(&NodeId::LOCAL) {
            for t in &local {
                let _ = catch_unwind(AssertUnwindSafe(|| f(t)));
            }
        }
        for (node, batch) in by_node {
            let worker = self.worker_for(caller, node);
            let f = Arc::clone(&f);
            let job: Job = Box::new(move || {
                for t in &batch {
                    let _ = catch_unwind(AssertUnwindSafe(|| f(t)));
                }
            });
            let _ = worker.send(job);
        }
    }
}

impl Default for Delegate {
    fn default() -> Self {
        Self::new()
    }
}

fn local_f<'a, T, R>(f: &'a Arc<dyn Fn(&T) -> R + Send + Sync>) -> impl Fn(&T) -> R + 'a {
    move |t| f(t)
}

fn apply_batch<T, R>(f: &impl Fn(&T) -> R, batch: Vec<T>) -> Vec<CallResult<T, R>> {
    batch
        .into_iter()
        .map(|t| match catch_unwind(AssertUnwindSafe(|| f(&t))) {
            Ok(r) => CallResult {
                target: t,
                status: CallStatus::Ok,
                result: Some(r),
            },
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                CallResult {
                    target: t,
                    status: CallStatus::Error(reason),
                    result: None,
                }
            }
        })
        .collect()
}

//! The queue actor: a single-threaded owner of one backing queue.
//!
//! The actor mediates publishers, consumers, per-consumer link credit, the
//! per-channel prefetch limiter, message TTL, queue expiry and publisher
//! confirms. Its mailbox is prioritised: control and introspection outrank
//! consumer traffic, which outranks publishes. All state it owns is plain
//! data; everything it talks to is reached by message passing.

pub mod consumers;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::core::backing_queue::{AckTag, BackingQueue, BqOp, BqStatus, TimeoutNeed, TxnId};
use crate::core::credit_flow::CreditFlow;
use crate::core::error::QueueError;
use crate::core::limiter::LimiterToken;
use crate::core::message::{now_us, Message, MessageId};
use crate::core::{ChannelId, QueueId};

use consumers::{
    ChannelRecord, Consumer, ConsumerTag, CreditMap, CreditRecord, Rosters, Unacked,
};

/// Deliveries in flight to one channel before its consumers are blocked.
pub const UNSENT_MESSAGE_LIMIT: u32 = 100;

/// Interval between rate remeasurements.
pub const RATE_INTERVAL: Duration = Duration::from_secs(5);

/// Idle window before pending commit work is pushed along.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(25);

const HIBERNATE_AFTER: Duration = Duration::from_secs(10);

/// Events a queue pushes at a channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Deliver {
        consumer_tag: ConsumerTag,
        ack_tag: Option<AckTag>,
        message: Arc<Message>,
        is_redelivered: bool,
    },
    /// Link-credit echo, notably the drain echo when credit exhausts.
    SendCredit {
        consumer_tag: ConsumerTag,
        count: u32,
        credit: u64,
        available: u64,
        drain: bool,
    },
    /// Publisher confirm for `msg_seq_no`.
    ConfirmOk { msg_seq_no: u64 },
    /// Credit-flow grant toward a publishing channel.
    CreditBump { bump: u32 },
}

/// The queue's end of a channel. Dropping the receiver counts as channel
/// death; the queue monitors for it.
#[derive(Clone)]
pub struct ChannelHandle {
    pub id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelHandle { id, tx }, rx)
    }

    fn send(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Queue argument table.
#[derive(Debug, Clone, Default)]
pub struct QueueArgs {
    /// `x-expires`: drop the queue after this many idle, consumerless ms.
    pub expires_ms: Option<u64>,
    /// `x-message-ttl`: stamp every publish with this TTL.
    pub message_ttl_ms: Option<u64>,
    /// `x-ha-policy`: selects the mirrored backing queue flavour.
    pub ha_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Str(String),
}

impl QueueArgs {
    pub fn parse(table: &HashMap<String, ArgValue>) -> Self {
        let int = |key: &str| match table.get(key) {
            Some(ArgValue::Int(n)) if *n >= 0 => Some(*n as u64),
            _ => None,
        };
        let string = |key: &str| match table.get(key) {
            Some(ArgValue::Str(s)) => Some(s.clone()),
            _ => None,
        };
        QueueArgs {
            expires_ms: int("x-expires"),
            message_ttl_ms: int("x-message-ttl"),
            ha_policy: string("x-ha-policy"),
        }
    }

    pub fn backing_queue_kind(&self) -> BackingQueueKind {
        if self.ha_policy.is_some() {
            BackingQueueKind::Mirrored
        } else {
            BackingQueueKind::Variable
        }
    }
}

/// Which backing queue flavour a declaration selects. The mirrored flavour
/// wraps the variable queue on its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingQueueKind {
    Variable,
    Mirrored,
}

#[derive(Debug, Clone)]
pub struct QueueDecl {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive_owner: Option<ChannelId>,
    pub args: QueueArgs,
}

/// Tuning knobs, normally taken from [`crate::config::QueueTuning`].
#[derive(Debug, Clone)]
pub struct QueueTuning {
    pub unsent_message_limit: u32,
    pub sync_timeout: Duration,
    pub rate_interval: Duration,
    /// Open switch: attempt direct delivery of a publish that meets an
    /// idle consumer, bypassing the queue proper.
    pub deliver_immediately: bool,
}

impl Default for QueueTuning {
    fn default() -> Self {
        QueueTuning {
            unsent_message_limit: UNSENT_MESSAGE_LIMIT,
            sync_timeout: SYNC_TIMEOUT,
            rate_interval: RATE_INTERVAL,
            deliver_immediately: false,
        }
    }
}

#[derive(Debug)]
pub struct GetOk {
    pub message: Arc<Message>,
    pub ack_tag: Option<AckTag>,
    pub is_redelivered: bool,
    pub remaining: u64,
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub len: u64,
    pub consumer_count: usize,
    pub unacked: usize,
    pub status: BqStatus,
}

pub struct CreditSpec {
    pub credit: u64,
    pub count: u32,
    pub drain: bool,
}

pub enum QueueCommand {
    // Priority 0.
    Publish {
        message: Arc<Message>,
        sender: Option<ChannelHandle>,
        confirm: Option<u64>,
    },
    BasicGet {
        ack_required: bool,
        channel: Option<ChannelHandle>,
        reply: oneshot::Sender<Option<GetOk>>,
    },
    Purge {
        reply: oneshot::Sender<u64>,
    },
    Delete {
        if_unused: bool,
        if_empty: bool,
        reply: oneshot::Sender<Result<u64, QueueError>>,
    },
    TxPublish {
        txn: TxnId,
        message: Arc<Message>,
    },
    TxAck {
        txn: TxnId,
        channel: ChannelId,
        tags: Vec<AckTag>,
    },
    TxRollback {
        txn: TxnId,
        reply: oneshot::Sender<Vec<AckTag>>,
    },
    TxCommit {
        txn: TxnId,
        reply: oneshot::Sender<()>,
    },
    // Priority 6.
    RunBackingQueue(BqOp),
    SyncTimeout,
    // Priority 7.
    BasicConsume {
        channel: ChannelHandle,
        tag: ConsumerTag,
        ack_required: bool,
        exclusive: bool,
        token: LimiterToken,
        credit: Option<CreditSpec>,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    BasicCancel {
        channel: ChannelId,
        tag: ConsumerTag,
        reply: oneshot::Sender<()>,
    },
    Ack {
        channel: ChannelId,
        tags: Vec<AckTag>,
    },
    Reject {
        channel: ChannelId,
        tags: Vec<AckTag>,
        requeue: bool,
    },
    NotifySent {
        channel: ChannelId,
    },
    Unblock {
        channel: ChannelId,
    },
    SetCredit {
        tag: ConsumerTag,
        credit: u64,
        count: u32,
        drain: bool,
        echo: bool,
    },
    EmitStats,
    // Priority 8.
    DeleteImmediately,
    SetRamDurationTarget {
        duration_s: Option<f64>,
    },
    ChannelDown {
        channel: ChannelId,
    },
    MaybeExpire,
    DropExpired,
    UpdateRamDuration,
    // Priority 9.
    Info {
        reply: oneshot::Sender<QueueInfo>,
    },
}

fn priority(cmd: &QueueCommand) -> u8 {
    use QueueCommand::*;
    match cmd {
        Info { .. } => 9,
        DeleteImmediately
        | SetRamDurationTarget { .. }
        | ChannelDown { .. }
        | MaybeExpire
        | DropExpired
        | UpdateRamDuration => 8,
        BasicConsume { .. }
        | BasicCancel { .. }
        | Ack { .. }
        | Reject { .. }
        | NotifySent { .. }
        | Unblock { .. }
        | SetCredit { .. }
        | EmitStats => 7,
        RunBackingQueue(_) | SyncTimeout => 6,
        _ => 0,
    }
}

struct Prioritized {
    pri: u8,
    arrival: u64,
    cmd: QueueCommand,
}

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.pri == other.pri && self.arrival == other.arrival
    }
}

impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; FIFO within a band.
        self.pri
            .cmp(&other.pri)
            .then(other.arrival.cmp(&self.arrival))
    }
}

/// Cloneable address of a queue actor.
#[derive(Clone)]
pub struct QueueHandle {
    pub id: QueueId,
    tx: mpsc::UnboundedSender<QueueCommand>,
}

type CallResult<T> = Result<T, QueueError>;

impl QueueHandle {
    fn cast(&self, cmd: QueueCommand) {
        let _ = self.tx.send(cmd);
    }

    async fn call<T>(&self, cmd: QueueCommand, rx: oneshot::Receiver<T>) -> CallResult<T> {
        self.tx.send(cmd).map_err(|_| QueueError::PeerExit)?;
        rx.await.map_err(|_| QueueError::PeerExit)
    }

    pub fn publish(&self, message: Arc<Message>) {
        self.cast(QueueCommand::Publish {
            message,
            sender: None,
            confirm: None,
        });
    }

    pub fn publish_from(&self, message: Arc<Message>, sender: ChannelHandle, confirm: Option<u64>) {
        self.cast(QueueCommand::Publish {
            message,
            sender: Some(sender),
            confirm,
        });
    }

    pub async fn basic_get(
        &self,
        ack_required: bool,
        channel: Option<ChannelHandle>,
    ) -> CallResult<Option<GetOk>> {
        let (tx, rx) = oneshot::channel();
        self.call(
            QueueCommand::BasicGet {
                ack_required,
                channel,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn basic_consume(
        &self,
        channel: ChannelHandle,
        tag: impl Into<String>,
        ack_required: bool,
        exclusive: bool,
        token: LimiterToken,
        credit: Option<CreditSpec>,
    ) -> CallResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(
            QueueCommand::BasicConsume {
                channel,
                tag: ConsumerTag(tag.into()),
                ack_required,
                exclusive,
                token,
                credit,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn basic_cancel(&self, channel: ChannelId, tag: impl Into<String>) -> CallResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(
            QueueCommand::BasicCancel {
                channel,
                tag: ConsumerTag(tag.into()),
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub fn ack(&self, channel: ChannelId, tags: Vec<AckTag>) {
        self.cast(QueueCommand::Ack { channel, tags });
    }

    pub fn reject(&self, channel: ChannelId, tags: Vec<AckTag>, requeue: bool) {
        self.cast(QueueCommand::Reject {
            channel,
            tags,
            requeue,
        });
    }

    pub fn notify_sent(&self, channel: ChannelId) {
        self.cast(QueueCommand::NotifySent { channel });
    }

    pub fn set_credit(
        &self,
        tag: impl Into<String>,
        credit: u64,
        count: u32,
        drain: bool,
        echo: bool,
    ) {
        self.cast(QueueCommand::SetCredit {
            tag: ConsumerTag(tag.into()),
            credit,
            count,
            drain,
            echo,
        });
    }

    pub async fn purge(&self) -> CallResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.call(QueueCommand::Purge { reply: tx }, rx).await
    }

    pub async fn delete(&self, if_unused: bool, if_empty: bool) -> CallResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.call(
            QueueCommand::Delete {
                if_unused,
                if_empty,
                reply: tx,
            },
            rx,
        )
        .await?
    }

    pub fn delete_immediately(&self) {
        self.cast(QueueCommand::DeleteImmediately);
    }

    pub fn set_ram_duration_target(&self, duration_s: Option<f64>) {
        self.cast(QueueCommand::SetRamDurationTarget { duration_s });
    }

    pub fn tx_publish(&self, txn: TxnId, message: Arc<Message>) {
        self.cast(QueueCommand::TxPublish { txn, message });
    }

    pub fn tx_ack(&self, txn: TxnId, channel: ChannelId, tags: Vec<AckTag>) {
        self.cast(QueueCommand::TxAck { txn, channel, tags });
    }

    pub async fn tx_rollback(&self, txn: TxnId) -> CallResult<Vec<AckTag>> {
        let (tx, rx) = oneshot::channel();
        self.call(QueueCommand::TxRollback { txn, reply: tx }, rx).await
    }

    pub async fn tx_commit(&self, txn: TxnId) -> CallResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(QueueCommand::TxCommit { txn, reply: tx }, rx).await
    }

    pub async fn info(&self) -> CallResult<QueueInfo> {
        let (tx, rx) = oneshot::channel();
        self.call(QueueCommand::Info { reply: tx }, rx).await
    }

    pub fn drop_expired(&self) {
        self.cast(QueueCommand::DropExpired);
    }

    pub fn run_backing_queue(&self, op: BqOp) {
        self.cast(QueueCommand::RunBackingQueue(op));
    }
}

enum Wake {
    Sync,
    Ttl,
    Expires,
    Rates,
    Hibernate,
}

pub struct QueueActor {
    id: QueueId,
    decl: QueueDecl,
    tuning: QueueTuning,
    bq: Box<dyn BackingQueue>,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    self_tx: mpsc::UnboundedSender<QueueCommand>,
    limiter_rx: mpsc::UnboundedReceiver<ChannelId>,
    limiter_tx: mpsc::UnboundedSender<ChannelId>,
    rosters: Rosters,
    credit: CreditMap,
    channels: HashMap<ChannelId, ChannelRecord>,
    /// Eventual confirms: message id -> (publishing channel, msg_seq_no).
    pending_confirms: HashMap<MessageId, (ChannelHandle, u64)>,
    credit_flow: CreditFlow<ChannelId>,
    exclusive_consumer: Option<(ChannelId, ConsumerTag)>,
    has_had_consumers: bool,
    last_activity: Instant,
    ttl_deadline: Option<Instant>,
    next_rates_at: Instant,
    hibernated: bool,
    arrival: u64,
}

impl QueueActor {
    pub fn spawn(id: QueueId, decl: QueueDecl, bq: Box<dyn BackingQueue>) -> QueueHandle {
        Self::spawn_with(id, decl, bq, QueueTuning::default())
    }

    pub fn spawn_with(
        id: QueueId,
        decl: QueueDecl,
        bq: Box<dyn BackingQueue>,
        tuning: QueueTuning,
    ) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (limiter_tx, limiter_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let next_rates_at = now + tuning.rate_interval;
        let actor = QueueActor {
            id,
            decl,
            tuning,
            bq,
            rx,
            self_tx: tx.clone(),
            limiter_rx,
            limiter_tx,
            rosters: Rosters::default(),
            credit: CreditMap::default(),
            channels: HashMap::new(),
            pending_confirms: HashMap::new(),
            credit_flow: CreditFlow::new(),
            exclusive_consumer: None,
            has_had_consumers: false,
            last_activity: now,
            ttl_deadline: None,
            next_rates_at,
            hibernated: false,
            arrival: 0,
        };
        tokio::spawn(actor.run());
        QueueHandle { id, tx }
    }

    async fn run(mut self) {
        info!(queue = %self.decl.name, "queue actor up");
        let mut heap: BinaryHeap<Prioritized> = BinaryHeap::new();
        loop {
            self.drain_mailboxes(&mut heap);
            if let Some(p) = heap.pop() {
                self.hibernated = false;
                if !self.handle(p.cmd) {
                    break;
                }
                self.fire_confirms();
                continue;
            }
            let (deadline, wake) = self.next_wake();
            enum Next {
                Cmd(Option<QueueCommand>),
                Limiter(Option<ChannelId>),
                Woke,
            }
            let next = tokio::select! {
                maybe = self.rx.recv() => Next::Cmd(maybe),
                maybe = self.limiter_rx.recv() => Next::Limiter(maybe),
                _ = tokio::time::sleep_until(deadline) => Next::Woke,
            };
            match next {
                Next::Cmd(Some(cmd)) => self.push(&mut heap, cmd),
                Next::Cmd(None) => break,
                Next::Limiter(Some(channel)) => {
                    self.push(&mut heap, QueueCommand::Unblock { channel })
                }
                Next::Limiter(None) => {}
                Next::Woke => match wake {
                    Wake::Sync => self.push(&mut heap, QueueCommand::SyncTimeout),
                    Wake::Ttl => self.push(&mut heap, QueueCommand::DropExpired),
                    Wake::Expires => self.push(&mut heap, QueueCommand::MaybeExpire),
                    Wake::Rates => self.push(&mut heap, QueueCommand::UpdateRamDuration),
                    Wake::Hibernate => self.pre_hibernate(),
                },
            }
        }
        info!(queue = %self.decl.name, "queue actor down");
    }

    fn push(&mut self, heap: &mut BinaryHeap<Prioritized>, cmd: QueueCommand) {
        self.arrival += 1;
        heap.push(Prioritized {
            pri: priority(&cmd),
            arrival: self.arrival,
            cmd,
        });
    }

    fn drain_mailboxes(&mut self, heap: &mut BinaryHeap<Prioritized>) {
        loop {
            let cmd = match self.rx.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            };
            self.push(heap, cmd);
        }
        loop {
            let channel = match self.limiter_rx.try_recv() {
                Ok(ch) => ch,
                Err(_) => break,
            };
            self.push(heap, QueueCommand::Unblock { channel });
        }
    }

    fn next_wake(&self) -> (Instant, Wake) {
        let now = Instant::now();
        let mut best = if self.hibernated {
            // Parked: nothing to do until the mailbox speaks.
            (now + Duration::from_secs(3600), Wake::Hibernate)
        } else {
            (now + HIBERNATE_AFTER, Wake::Hibernate)
        };
        match self.bq.needs_timeout() {
            TimeoutNeed::Timed | TimeoutNeed::Idle => {
                let at = now + self.tuning.sync_timeout;
                if at < best.0 {
                    best = (at, Wake::Sync);
                }
            }
            TimeoutNeed::False => {}
        }
        if let Some(at) = self.ttl_deadline {
            if at < best.0 {
                best = (at, Wake::Ttl);
            }
        }
        if let Some(expires_ms) = self.decl.args.expires_ms {
            if self.consumer_total() == 0 {
                let at = self.last_activity + Duration::from_millis(expires_ms);
                if at < best.0 {
                    best = (at, Wake::Expires);
                }
            }
        }
        if !self.hibernated
            && (self.bq.len() > 0 || self.consumer_total() > 0)
            && self.next_rates_at < best.0
        {
            best = (self.next_rates_at, Wake::Rates);
        }
        best
    }

    fn pre_hibernate(&mut self) {
        if self.hibernated {
            return;
        }
        let _ = self.bq.update_ram_duration();
        if let Err(e) = self.bq.handle_pre_hibernate() {
            warn!(queue = %self.decl.name, error = %e, "pre-hibernate flush failed");
        }
        self.hibernated = true;
        debug!(queue = %self.decl.name, "hibernating");
    }

    fn consumer_total(&self) -> usize {
        self.rosters.total()
    }

    /// Returns false when the actor should stop.
    fn handle(&mut self, cmd: QueueCommand) -> bool {
        use QueueCommand::*;
        match cmd {
            Publish {
                message,
                sender,
                confirm,
            } => {
                self.last_activity = Instant::now();
                self.handle_publish(message, sender, confirm);
            }
            BasicGet {
                ack_required,
                channel,
                reply,
            } => {
                self.last_activity = Instant::now();
                let got = self.handle_basic_get(ack_required, channel);
                let _ = reply.send(got);
            }
            Purge { reply } => {
                let purged = self.bq.purge().unwrap_or(0);
                let _ = reply.send(purged);
            }
            Delete {
                if_unused,
                if_empty,
                reply,
            } => {
                if if_unused && self.consumer_total() > 0 {
                    let _ = reply.send(Err(QueueError::InUse));
                    return true;
                }
                if if_empty && self.bq.len() > 0 {
                    let _ = reply.send(Err(QueueError::InUse));
                    return true;
                }
                let purged = self.bq.delete_and_terminate().unwrap_or(0);
                let _ = reply.send(Ok(purged));
                return false;
            }
            TxPublish { txn, message } => {
                let message = self.stamp_ttl(message);
                if let Err(e) = self.bq.tx_publish(txn, message) {
                    warn!(queue = %self.decl.name, error = %e, "tx publish failed");
                }
            }
            TxAck { txn, channel, tags } => {
                if let Some(rec) = self.channels.get_mut(&channel) {
                    for tag in &tags {
                        rec.unacked.remove(&tag.seq_id());
                    }
                }
                let _ = self.bq.tx_ack(txn, tags);
            }
            TxRollback { txn, reply } => {
                let acks = self.bq.tx_rollback(txn).unwrap_or_default();
                let _ = reply.send(acks);
            }
            TxCommit { txn, reply } => {
                let self_tx = self.self_tx.clone();
                let on_persisted = Box::new(move || {
                    let op: BqOp = Box::new(|bq: &mut dyn BackingQueue| {
                        if let Err(e) = bq.tx_commit_post_store_sync() {
                            warn!(error = %e, "commit finalise failed");
                        }
                    });
                    let _ = self_tx.send(QueueCommand::RunBackingQueue(op));
                });
                let replier = Box::new(move || {
                    let _ = reply.send(());
                });
                match self.bq.tx_commit(txn, on_persisted, replier) {
                    Ok(deferred) => trace!(deferred, "tx commit"),
                    Err(e) => warn!(queue = %self.decl.name, error = %e, "tx commit failed"),
                }
                self.deliver_msgs_to_consumers();
            }
            RunBackingQueue(op) => {
                self.bq.invoke(op);
                self.deliver_msgs_to_consumers();
            }
            SyncTimeout => {
                if let Err(e) = self.bq.flush_journal() {
                    warn!(queue = %self.decl.name, error = %e, "journal flush failed");
                }
            }
            BasicConsume {
                channel,
                tag,
                ack_required,
                exclusive,
                token,
                credit,
                reply,
            } => {
                self.last_activity = Instant::now();
                let outcome = self.handle_basic_consume(
                    channel,
                    tag,
                    ack_required,
                    exclusive,
                    token,
                    credit,
                );
                let _ = reply.send(outcome);
                self.deliver_msgs_to_consumers();
            }
            BasicCancel {
                channel,
                tag,
                reply,
            } => {
                self.last_activity = Instant::now();
                self.handle_basic_cancel(channel, &tag);
                let _ = reply.send(());
                if self.should_auto_delete() {
                    self.stop_and_delete();
                    return false;
                }
            }
            Ack { channel, tags } => {
                self.last_activity = Instant::now();
                self.handle_ack(channel, &tags);
                self.deliver_msgs_to_consumers();
            }
            Reject {
                channel,
                tags,
                requeue,
            } => {
                self.last_activity = Instant::now();
                self.handle_reject(channel, tags, requeue);
                self.deliver_msgs_to_consumers();
            }
            NotifySent { channel } => {
                self.handle_notify_sent(channel);
            }
            Unblock { channel } => {
                if let Some(rec) = self.channels.get_mut(&channel) {
                    rec.limit_active = false;
                }
                self.unblock_channel(channel);
                self.deliver_msgs_to_consumers();
            }
            SetCredit {
                tag,
                credit,
                count,
                drain,
                echo,
            } => {
                self.handle_set_credit(tag, credit, count, drain, echo);
                self.deliver_msgs_to_consumers();
            }
            EmitStats => {
                let st = self.bq.status();
                info!(
                    queue = %self.decl.name,
                    len = st.len,
                    ram = st.ram_msg_count,
                    consumers = self.consumer_total(),
                    "stats"
                );
            }
            DeleteImmediately => {
                self.stop_and_delete();
                return false;
            }
            SetRamDurationTarget { duration_s } => {
                if let Err(e) = self.bq.set_ram_duration_target(duration_s) {
                    warn!(queue = %self.decl.name, error = %e, "set ram duration failed");
                }
            }
            ChannelDown { channel } => {
                self.handle_ch_down(channel);
                if self.decl.exclusive_owner == Some(channel) || self.should_auto_delete() {
                    self.stop_and_delete();
                    return false;
                }
                self.deliver_msgs_to_consumers();
            }
            MaybeExpire => {
                if let Some(expires_ms) = self.decl.args.expires_ms {
                    if self.consumer_total() == 0
                        && self.last_activity.elapsed() >= Duration::from_millis(expires_ms)
                    {
                        info!(queue = %self.decl.name, "expired");
                        let _ = self.bq.terminate();
                        return false;
                    }
                }
            }
            DropExpired => {
                self.drop_expired_now();
                self.rearm_ttl();
            }
            UpdateRamDuration => {
                if let Err(e) = self.bq.update_ram_duration() {
                    warn!(queue = %self.decl.name, error = %e, "rate update failed");
                }
                self.next_rates_at = Instant::now() + self.tuning.rate_interval;
            }
            Info { reply } => {
                let _ = reply.send(QueueInfo {
                    name: self.decl.name.clone(),
                    len: self.bq.len(),
                    consumer_count: self.consumer_total(),
                    unacked: self.channels.values().map(|c| c.unacked.len()).sum(),
                    status: self.bq.status(),
                });
            }
        }
        true
    }

    fn stamp_ttl(&self, message: Arc<Message>) -> Arc<Message> {
        match self.decl.args.message_ttl_ms {
            Some(ttl_ms) if message.props().expiry_us.is_none() => {
                let mut stamped = (*message).clone();
                stamped.stamp_expiry(now_us() + ttl_ms * 1_000);
                Arc::new(stamped)
            }
            _ => message,
        }
    }

    fn handle_publish(
        &mut self,
        message: Arc<Message>,
        sender: Option<ChannelHandle>,
        confirm: Option<u64>,
    ) {
        let message = self.stamp_ttl(message);
        // Producer-side backpressure bookkeeping.
        if let Some(ref sender) = sender {
            for grant in self.credit_flow.ack(sender.id) {
                if grant.peer == sender.id {
                    sender.send(ChannelEvent::CreditBump { bump: grant.bump });
                } else if let Some(rec) = self.channels.get(&grant.peer) {
                    rec.handle.send(ChannelEvent::CreditBump { bump: grant.bump });
                }
            }
        }
        // Confirm classification: never / immediately / eventually.
        let confirm_with = confirm.zip(sender);
        let eventually = message.is_persistent() && self.decl.durable && confirm_with.is_some();

        let delivered_inline = self.tuning.deliver_immediately
            && self.bq.is_empty()
            && self.try_immediate_delivery(&message);
        if !delivered_inline {
            if let Err(e) = self.bq.publish(Arc::clone(&message)) {
                warn!(queue = %self.decl.name, error = %e, "publish failed");
                return;
            }
        }

        if let Some((msg_seq_no, channel)) = confirm_with {
            if eventually {
                self.pending_confirms
                    .insert(message.id(), (channel, msg_seq_no));
            } else {
                channel.send(ChannelEvent::ConfirmOk { msg_seq_no });
            }
        }
        if self.ttl_deadline.is_none() {
            self.rearm_ttl();
        }
        self.deliver_msgs_to_consumers();
    }

    /// Direct delivery of a fresh publish to an idle consumer; the message
    /// never enters the queue proper.
    fn try_immediate_delivery(&mut self, message: &Arc<Message>) -> bool {
        let Some(consumer) = self.rosters.pop_active() else {
            return false;
        };
        if !self.credit.credit_left(&consumer.tag)
            || !consumer.token.can_send(self.id, consumer.ack_required)
        {
            self.rosters.push_active(consumer);
            return false;
        }
        let ack_tag = match self
            .bq
            .publish_delivered(consumer.ack_required, Arc::clone(message))
        {
            Ok(tag) => tag,
            Err(e) => {
                warn!(queue = %self.decl.name, error = %e, "immediate delivery failed");
                self.rosters.push_active(consumer);
                return false;
            }
        };
        self.deliver_to(&consumer, ack_tag, Arc::clone(message), false);
        self.credit.decr(&consumer.tag, self.bq.len());
        self.requeue_consumer(consumer);
        true
    }

    fn handle_basic_get(
        &mut self,
        ack_required: bool,
        channel: Option<ChannelHandle>,
    ) -> Option<GetOk> {
        self.drop_expired_now();
        // An ack-requiring get must name the channel that will ack.
        let ack_required = ack_required && channel.is_some();
        let fetched = match self.bq.fetch(ack_required) {
            Ok(f) => f?,
            Err(e) => {
                warn!(queue = %self.decl.name, error = %e, "fetch failed");
                return None;
            }
        };
        if let (Some(tag), Some(channel)) = (fetched.ack_tag, channel) {
            let rec = self.channel_record(channel);
            rec.unacked.insert(
                tag.seq_id(),
                Unacked {
                    tag,
                    msg: Arc::clone(&fetched.message),
                    consumer_tag: ConsumerTag(String::new()),
                },
            );
        }
        Some(GetOk {
            message: fetched.message,
            ack_tag: fetched.ack_tag,
            is_redelivered: fetched.is_delivered,
            remaining: fetched.remaining,
        })
    }

    fn handle_basic_consume(
        &mut self,
        channel: ChannelHandle,
        tag: ConsumerTag,
        ack_required: bool,
        exclusive: bool,
        token: LimiterToken,
        credit: Option<CreditSpec>,
    ) -> Result<(), QueueError> {
        if self.exclusive_consumer.is_some() {
            return Err(QueueError::InUse);
        }
        if exclusive && self.consumer_total() > 0 {
            return Err(QueueError::InUse);
        }
        let ch_id = channel.id;
        token.register(self.id, self.limiter_tx.clone());
        let rec = self.channel_record_with_token(channel, token.clone());
        rec.consumer_count += 1;
        if exclusive {
            self.exclusive_consumer = Some((ch_id, tag.clone()));
        }
        if let Some(spec) = credit {
            self.credit.insert(
                tag.clone(),
                CreditRecord {
                    credit: spec.credit,
                    count: spec.count,
                    drain: spec.drain,
                },
            );
        }
        self.has_had_consumers = true;
        self.rosters.push_active(Consumer {
            channel: ch_id,
            tag,
            ack_required,
            token,
        });
        Ok(())
    }

    fn handle_basic_cancel(&mut self, channel: ChannelId, tag: &ConsumerTag) {
        if self.rosters.remove_tag(tag).is_some() {
            if let Some(rec) = self.channels.get_mut(&channel) {
                rec.consumer_count = rec.consumer_count.saturating_sub(1);
            }
        }
        self.credit.remove(tag);
        if self
            .exclusive_consumer
            .as_ref()
            .is_some_and(|(ch, t)| *ch == channel && t == tag)
        {
            self.exclusive_consumer = None;
        }
        self.maybe_gc_channel(channel);
    }

    fn handle_ack(&mut self, channel: ChannelId, tags: &[AckTag]) {
        let mut acked = Vec::with_capacity(tags.len());
        if let Some(rec) = self.channels.get_mut(&channel) {
            for tag in tags {
                if rec.unacked.remove(&tag.seq_id()).is_some() {
                    acked.push(*tag);
                }
            }
        }
        if !acked.is_empty() {
            if let Err(e) = self.bq.ack(&acked) {
                warn!(queue = %self.decl.name, error = %e, "ack failed");
            }
        }
        self.maybe_gc_channel(channel);
    }

    fn handle_reject(&mut self, channel: ChannelId, tags: Vec<AckTag>, requeue: bool) {
        let mut entries = Vec::with_capacity(tags.len());
        if let Some(rec) = self.channels.get_mut(&channel) {
            for tag in &tags {
                if let Some(unacked) = rec.unacked.remove(&tag.seq_id()) {
                    entries.push((unacked.tag, unacked.msg));
                }
            }
        }
        if entries.is_empty() {
            return;
        }
        entries.sort_by_key(|(tag, _)| tag.seq_id());
        let outcome = if requeue {
            self.bq.requeue(entries)
        } else {
            let discarded: Vec<AckTag> = entries.iter().map(|(t, _)| *t).collect();
            self.bq.ack(&discarded)
        };
        if let Err(e) = outcome {
            warn!(queue = %self.decl.name, error = %e, "reject failed");
        }
        self.maybe_gc_channel(channel);
    }

    fn handle_notify_sent(&mut self, channel: ChannelId) {
        let unblocked = {
            let Some(rec) = self.channels.get_mut(&channel) else {
                return;
            };
            let was_blocked = rec.unsent >= self.tuning.unsent_message_limit;
            rec.unsent = rec.unsent.saturating_sub(1);
            was_blocked && rec.unsent < self.tuning.unsent_message_limit && !rec.limit_active
        };
        if unblocked {
            self.unblock_channel(channel);
            self.deliver_msgs_to_consumers();
        }
        self.maybe_gc_channel(channel);
    }

    fn handle_set_credit(
        &mut self,
        tag: ConsumerTag,
        credit: u64,
        count: u32,
        drain: bool,
        echo: bool,
    ) {
        let (rec, woke) = self.credit.update(&tag, credit, count, drain);
        if woke && self.rosters.is_parked(&tag) {
            self.rosters.promote(&tag);
        }
        if echo {
            let available = self.bq.len();
            if let Some(ch) = self.channel_of_consumer(&tag) {
                ch.send(ChannelEvent::SendCredit {
                    consumer_tag: tag,
                    count: rec.count,
                    credit: rec.credit,
                    available,
                    drain: rec.drain,
                });
            }
        }
    }

    fn channel_of_consumer(&self, tag: &ConsumerTag) -> Option<ChannelHandle> {
        let ch = self.rosters.find_channel(tag)?;
        self.channels.get(&ch).map(|rec| rec.handle.clone())
    }

    fn handle_ch_down(&mut self, channel: ChannelId) {
        debug!(queue = %self.decl.name, channel = channel.0, "channel down");
        let removed = self.rosters.remove_channel(channel);
        for c in &removed {
            self.credit.remove(&c.tag);
        }
        if self
            .exclusive_consumer
            .as_ref()
            .is_some_and(|(ch, _)| *ch == channel)
        {
            self.exclusive_consumer = None;
        }
        if let Some(rec) = self.channels.remove(&channel) {
            // Requeue the channel's unacked deliveries in seq order.
            let pairs: Vec<(AckTag, Arc<Message>)> =
                rec.unacked.into_values().map(|u| (u.tag, u.msg)).collect();
            if !pairs.is_empty() {
                if let Err(e) = self.bq.requeue(pairs) {
                    warn!(queue = %self.decl.name, error = %e, "requeue on channel down failed");
                }
            }
            rec.token.unregister(self.id);
        }
        for grant in self.credit_flow.peer_down(channel) {
            if let Some(rec) = self.channels.get(&grant.peer) {
                rec.handle.send(ChannelEvent::CreditBump { bump: grant.bump });
            }
        }
    }

    fn should_auto_delete(&self) -> bool {
        self.decl.auto_delete && self.has_had_consumers && self.consumer_total() == 0
    }

    fn stop_and_delete(&mut self) {
        info!(queue = %self.decl.name, "deleting");
        if let Err(e) = self.bq.delete_and_terminate() {
            warn!(queue = %self.decl.name, error = %e, "delete failed");
        }
    }

    fn drop_expired_now(&mut self) {
        if self.decl.args.message_ttl_ms.is_none() {
            return;
        }
        let now = now_us();
        match self
            .bq
            .dropwhile(&mut |props| matches!(props.expiry_us, Some(at) if at <= now))
        {
            Ok(0) => {}
            Ok(n) => debug!(queue = %self.decl.name, dropped = n, "expired messages dropped"),
            Err(e) => warn!(queue = %self.decl.name, error = %e, "dropwhile failed"),
        }
    }

    fn rearm_ttl(&mut self) {
        self.ttl_deadline = match self.decl.args.message_ttl_ms {
            Some(ttl_ms) if self.bq.len() > 0 => {
                Some(Instant::now() + Duration::from_millis(ttl_ms))
            }
            _ => None,
        };
    }

    fn channel_record(&mut self, handle: ChannelHandle) -> &mut ChannelRecord {
        self.channel_record_with_token(handle, LimiterToken::disabled())
    }

    fn channel_record_with_token(
        &mut self,
        handle: ChannelHandle,
        token: LimiterToken,
    ) -> &mut ChannelRecord {
        let ch_id = handle.id;
        if !self.channels.contains_key(&ch_id) {
            // Monitor: channel death surfaces as a mailbox command.
            let watcher = handle.clone();
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                watcher.closed().await;
                let _ = self_tx.send(QueueCommand::ChannelDown {
                    channel: watcher.id,
                });
            });
            self.channels
                .insert(ch_id, ChannelRecord::new(handle, token));
        }
        self.channels.get_mut(&ch_id).expect("inserted above")
    }

    fn maybe_gc_channel(&mut self, channel: ChannelId) {
        let dead = self
            .channels
            .get(&channel)
            .is_some_and(ChannelRecord::is_dead);
        if dead {
            let rec = self.channels.remove(&channel).expect("checked above");
            rec.token.unregister(self.id);
        }
    }

    fn channel_is_blocked(&self, channel: ChannelId) -> bool {
        self.channels.get(&channel).is_some_and(|rec| {
            rec.limit_active || rec.unsent >= self.tuning.unsent_message_limit
        })
    }

    fn unblock_channel(&mut self, channel: ChannelId) {
        if self.channel_is_blocked(channel) {
            return;
        }
        let credit = &self.credit;
        self.rosters
            .unblock_channel(channel, |c| !credit.credit_left(&c.tag));
    }

    fn deliver_to(
        &mut self,
        consumer: &Consumer,
        ack_tag: Option<AckTag>,
        message: Arc<Message>,
        is_redelivered: bool,
    ) {
        let rec = self
            .channels
            .get_mut(&consumer.channel)
            .expect("consumer channels always have a record");
        rec.handle.send(ChannelEvent::Deliver {
            consumer_tag: consumer.tag.clone(),
            ack_tag,
            message: Arc::clone(&message),
            is_redelivered,
        });
        rec.unsent += 1;
        if let Some(tag) = ack_tag {
            rec.unacked.insert(
                tag.seq_id(),
                Unacked {
                    tag,
                    msg: message,
                    consumer_tag: consumer.tag.clone(),
                },
            );
        }
    }

    /// Put a consumer back on the right roster after a delivery.
    fn requeue_consumer(&mut self, consumer: Consumer) {
        let ch = consumer.channel;
        if self.channel_is_blocked(ch) {
            self.rosters.push_blocked(consumer);
            self.rosters.block_channel(ch);
        } else if self.credit.credit_left(&consumer.tag) {
            self.rosters.push_active(consumer);
        } else {
            self.rosters.push_blocked(consumer);
        }
    }

    /// The dispatch loop: round-robin over active consumers while messages
    /// and permissions last.
    fn deliver_msgs_to_consumers(&mut self) {
        self.drop_expired_now();
        while !self.bq.is_empty() && self.rosters.has_active() {
            let consumer = self.rosters.pop_active().expect("checked active");
            let ch = consumer.channel;
            let has_credit = self.credit.credit_left(&consumer.tag);
            if has_credit && consumer.token.can_send(self.id, consumer.ack_required) {
                let fetched = match self.bq.fetch(consumer.ack_required) {
                    Ok(Some(f)) => f,
                    Ok(None) => {
                        self.rosters.push_active(consumer);
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %self.decl.name, error = %e, "fetch failed");
                        self.rosters.push_active(consumer);
                        break;
                    }
                };
                let len_after = fetched.remaining;
                self.deliver_to(
                    &consumer,
                    fetched.ack_tag,
                    fetched.message,
                    fetched.is_delivered,
                );
                if let Some(new_credit) = self.credit.decr(&consumer.tag, len_after) {
                    if new_credit.drain && !new_credit.credit_left() {
                        let rec = self
                            .channels
                            .get(&ch)
                            .expect("consumer channels always have a record");
                        rec.handle.send(ChannelEvent::SendCredit {
                            consumer_tag: consumer.tag.clone(),
                            count: new_credit.count,
                            credit: 0,
                            available: len_after,
                            drain: true,
                        });
                    }
                }
                self.requeue_consumer(consumer);
            } else if !has_credit {
                self.rosters.push_blocked(consumer);
            } else {
                // Limiter refused: park the whole channel until it notifies.
                if let Some(rec) = self.channels.get_mut(&ch) {
                    rec.limit_active = true;
                }
                self.rosters.push_blocked(consumer);
                self.rosters.block_channel(ch);
            }
        }
    }

    /// Route store confirms to their waiting publishers.
    fn fire_confirms(&mut self) {
        for msg_id in self.bq.drain_confirmed() {
            if let Some((channel, msg_seq_no)) = self.pending_confirms.remove(&msg_id) {
                channel.send(ChannelEvent::ConfirmOk { msg_seq_no });
            }
        }
    }
}

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use quillmq::core::backing_queue::AckTag;
use quillmq::core::index::MemIndex;
use quillmq::core::queue::{
    ChannelEvent, ChannelHandle, QueueActor, QueueArgs, QueueDecl, QueueHandle, QueueTuning,
};
use quillmq::core::store::MemStore;
use quillmq::core::vq::VariableQueue;
use quillmq::core::{ChannelId, QueueId};
use quillmq::Message;

pub const SEGMENT_SIZE: u64 = 16;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let guard = quillmq::logging::init_logging();
        std::mem::forget(guard);
    });
}

pub struct TestQueue {
    pub handle: QueueHandle,
    pub store: MemStore,
}

pub fn spawn_queue(name: &str, durable: bool) -> TestQueue {
    spawn_queue_with(
        name,
        durable,
        false,
        None,
        QueueArgs::default(),
        QueueTuning::default(),
    )
}

pub fn spawn_queue_with(
    name: &str,
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<ChannelId>,
    args: QueueArgs,
    tuning: QueueTuning,
) -> TestQueue {
    init_logging();
    let store = MemStore::new();
    let vq = VariableQueue::new(
        Box::new(store.clone()),
        Box::new(MemIndex::new(SEGMENT_SIZE)),
        durable,
        None,
    );
    let decl = QueueDecl {
        name: name.to_string(),
        durable,
        auto_delete,
        exclusive_owner,
        args,
    };
    let handle = QueueActor::spawn_with(QueueId(1), decl, Box::new(vq), tuning);
    TestQueue { handle, store }
}

pub fn channel(id: u64) -> (ChannelHandle, UnboundedReceiver<ChannelEvent>) {
    ChannelHandle::new(ChannelId(id))
}

pub async fn recv_event(rx: &mut UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("channel event stream closed")
}

pub async fn recv_delivery(
    rx: &mut UnboundedReceiver<ChannelEvent>,
) -> (Option<AckTag>, std::sync::Arc<Message>, bool) {
    match recv_event(rx).await {
        ChannelEvent::Deliver {
            ack_tag,
            message,
            is_redelivered,
            ..
        } => (ack_tag, message, is_redelivered),
        other => panic!("expected a delivery, got {other:?}"),
    }
}

pub async fn expect_silence(rx: &mut UnboundedReceiver<ChannelEvent>) {
    let res = timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(res.is_err(), "expected no channel event, got {:?}", res);
}

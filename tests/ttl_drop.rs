//! Message TTL: expired messages are gone before any consumer sees them.

mod common;

use std::sync::Arc;
use std::time::Duration;

use quillmq::core::limiter::LimiterToken;
use quillmq::core::queue::QueueArgs;
use quillmq::Message;

use common::{channel, expect_silence, spawn_queue_with};

#[tokio::test]
async fn expired_messages_are_dropped_before_delivery() {
    let q = spawn_queue_with(
        "ttl",
        false,
        false,
        None,
        QueueArgs {
            message_ttl_ms: Some(100),
            ..Default::default()
        },
        Default::default(),
    );

    for i in 0..3 {
        q.handle
            .publish(Arc::new(Message::new(format!("m{i}"), false)));
    }
    assert_eq!(q.handle.info().await.unwrap().len, 3);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // A late subscriber sees nothing.
    let (ch, mut rx) = channel(1);
    q.handle
        .basic_consume(ch, "late", false, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
    expect_silence(&mut rx).await;
    assert_eq!(q.handle.info().await.unwrap().len, 0);
}

#[tokio::test]
async fn unexpired_messages_still_flow() {
    let q = spawn_queue_with(
        "ttl-flow",
        false,
        false,
        None,
        QueueArgs {
            message_ttl_ms: Some(60_000),
            ..Default::default()
        },
        Default::default(),
    );
    q.handle.publish(Arc::new(Message::new("alive", false)));
    let got = q.handle.basic_get(false, None).await.unwrap().unwrap();
    assert_eq!(got.message.payload().as_ref(), b"alive");
    assert_eq!(got.remaining, 0);
}

#[tokio::test]
async fn basic_get_skips_expired_heads() {
    let q = spawn_queue_with(
        "ttl-get",
        false,
        false,
        None,
        QueueArgs {
            message_ttl_ms: Some(50),
            ..Default::default()
        },
        Default::default(),
    );
    q.handle.publish(Arc::new(Message::new("stale", false)));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(q.handle.basic_get(false, None).await.unwrap().is_none());
}

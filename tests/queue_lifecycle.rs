//! Queue lifecycle: exclusive consumers, auto-delete, purge and delete,
//! idle expiry, and the RAM duration target.

mod common;

use std::sync::Arc;
use std::time::Duration;

use quillmq::core::limiter::LimiterToken;
use quillmq::core::queue::QueueArgs;
use quillmq::core::ChannelId;
use quillmq::{Message, QueueError};

use common::{channel, recv_delivery, spawn_queue, spawn_queue_with, SEGMENT_SIZE};

#[tokio::test]
async fn exclusive_consumer_locks_out_everyone_else() {
    let q = spawn_queue("exclusive", false);
    let (ch1, _rx1) = channel(1);
    let (ch2, _rx2) = channel(2);

    q.handle
        .basic_consume(ch1, "first", true, true, LimiterToken::disabled(), None)
        .await
        .unwrap();
    let err = q
        .handle
        .basic_consume(ch2, "second", true, false, LimiterToken::disabled(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InUse));
}

#[tokio::test]
async fn exclusive_request_fails_against_existing_consumers() {
    let q = spawn_queue("exclusive-late", false);
    let (ch1, _rx1) = channel(1);
    let (ch2, _rx2) = channel(2);
    q.handle
        .basic_consume(ch1, "plain", true, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
    let err = q
        .handle
        .basic_consume(ch2, "greedy", true, true, LimiterToken::disabled(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InUse));
}

#[tokio::test]
async fn cancelling_the_exclusive_consumer_frees_the_queue() {
    let q = spawn_queue("exclusive-free", false);
    let (ch1, _rx1) = channel(1);
    let (ch2, _rx2) = channel(2);
    q.handle
        .basic_consume(ch1.clone(), "ex", true, true, LimiterToken::disabled(), None)
        .await
        .unwrap();
    q.handle.basic_cancel(ChannelId(1), "ex").await.unwrap();
    q.handle
        .basic_consume(ch2, "next", true, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn auto_delete_fires_after_the_last_cancel() {
    let q = spawn_queue_with(
        "auto-del",
        false,
        true,
        None,
        Default::default(),
        Default::default(),
    );
    let (ch, _rx) = channel(1);
    q.handle
        .basic_consume(ch, "only", false, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
    q.handle.basic_cancel(ChannelId(1), "only").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(q.handle.info().await.is_err(), "queue should be gone");
}

#[tokio::test]
async fn purge_and_conditional_delete() {
    let q = spawn_queue("purge-del", false);
    for i in 0..5 {
        q.handle
            .publish(Arc::new(Message::new(format!("m{i}"), false)));
    }
    assert_eq!(q.handle.purge().await.unwrap(), 5);
    assert_eq!(q.handle.purge().await.unwrap(), 0);

    q.handle.publish(Arc::new(Message::new("left", false)));
    let err = q.handle.delete(false, true).await.unwrap_err();
    assert!(matches!(err, QueueError::InUse));
    assert_eq!(q.handle.delete(false, false).await.unwrap(), 1);
    assert!(q.handle.info().await.is_err());
}

#[tokio::test]
async fn idle_queue_with_x_expires_goes_away() {
    let q = spawn_queue_with(
        "expiring",
        false,
        false,
        None,
        QueueArgs {
            expires_ms: Some(100),
            ..Default::default()
        },
        Default::default(),
    );
    q.handle.publish(Arc::new(Message::new("orphan", false)));
    assert_eq!(q.handle.info().await.unwrap().len, 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(q.handle.info().await.is_err(), "queue should have expired");
}

#[tokio::test]
async fn consumers_keep_an_x_expires_queue_alive() {
    let q = spawn_queue_with(
        "kept-alive",
        false,
        false,
        None,
        QueueArgs {
            expires_ms: Some(100),
            ..Default::default()
        },
        Default::default(),
    );
    let (ch, _rx) = channel(1);
    q.handle
        .basic_consume(ch, "keeper", false, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(q.handle.info().await.is_ok());
}

#[tokio::test]
async fn ram_duration_target_zero_pushes_everything_out() {
    let q = spawn_queue("ram-target", false);
    for i in 0..100 {
        q.handle
            .publish(Arc::new(Message::new(format!("m{i}"), false)));
    }
    q.handle.set_ram_duration_target(Some(0.0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let info = q.handle.info().await.unwrap();
    assert_eq!(info.status.ram_msg_count, 0);
    assert_eq!(info.status.depths.delta, 100 - SEGMENT_SIZE);
    assert_eq!(info.len, 100);

    // Draining brings the bodies back in publish order.
    let (ch, mut rx) = channel(1);
    q.handle
        .basic_consume(ch, "drain", false, false, LimiterToken::disabled(), None)
        .await
        .unwrap();
    for i in 0..100 {
        let (_, m, _) = recv_delivery(&mut rx).await;
        assert_eq!(m.payload().as_ref(), format!("m{i}").as_bytes());
    }
}

#[tokio::test]
async fn basic_get_with_ack_and_reject_requeue() {
    let q = spawn_queue("get-reject", false);
    let (ch, _rx) = channel(1);
    q.handle.publish(Arc::new(Message::new("bounce", false)));

    let got = q
        .handle
        .basic_get(true, Some(ch.clone()))
        .await
        .unwrap()
        .unwrap();
    let tag = got.ack_tag.unwrap();
    assert_eq!(q.handle.info().await.unwrap().len, 0);

    q.handle.reject(ChannelId(1), vec![tag], true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let info = q.handle.info().await.unwrap();
    assert_eq!(info.len, 1);

    let again = q.handle.basic_get(false, None).await.unwrap().unwrap();
    assert!(again.is_redelivered);
    assert_eq!(again.message.payload().as_ref(), b"bounce");
}

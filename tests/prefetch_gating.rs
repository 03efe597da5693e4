//! Prefetch gating: a consumer with prefetch 2 receives exactly two
//! deliveries until acks make room.

mod common;

use std::sync::Arc;

use quillmq::core::limiter::Limiter;
use quillmq::core::ChannelId;
use quillmq::Message;

use common::{channel, expect_silence, recv_delivery, spawn_queue};

#[tokio::test]
async fn prefetch_two_gates_at_two_in_flight() {
    let q = spawn_queue("prefetch", false);
    let (ch, mut rx) = channel(1);
    let limiter = Limiter::new(ChannelId(1), 2);

    q.handle
        .basic_consume(ch.clone(), "c1", true, false, limiter.token(), None)
        .await
        .unwrap();

    for i in 0..5 {
        q.handle
            .publish(Arc::new(Message::new(format!("m{i}"), false)));
    }

    let (tag1, m1, _) = recv_delivery(&mut rx).await;
    let (tag2, m2, _) = recv_delivery(&mut rx).await;
    assert_eq!(m1.payload().as_ref(), b"m0");
    assert_eq!(m2.payload().as_ref(), b"m1");
    // At the cap: no third delivery.
    expect_silence(&mut rx).await;

    // Acking one makes room for exactly one more.
    q.handle.ack(ChannelId(1), vec![tag1.unwrap()]);
    limiter.ack(1);
    let (tag3, m3, _) = recv_delivery(&mut rx).await;
    assert_eq!(m3.payload().as_ref(), b"m2");
    expect_silence(&mut rx).await;

    // Acking the rest drains the queue.
    q.handle
        .ack(ChannelId(1), vec![tag2.unwrap(), tag3.unwrap()]);
    limiter.ack(2);
    let (_, m4, _) = recv_delivery(&mut rx).await;
    let (_, m5, _) = recv_delivery(&mut rx).await;
    assert_eq!(m4.payload().as_ref(), b"m3");
    assert_eq!(m5.payload().as_ref(), b"m4");

    let info = q.handle.info().await.unwrap();
    assert_eq!(info.len, 0);
}

#[tokio::test]
async fn non_ack_consumers_ignore_prefetch() {
    let q = spawn_queue("prefetch-noack", false);
    let (ch, mut rx) = channel(2);
    let limiter = Limiter::new(ChannelId(2), 1);

    q.handle
        .basic_consume(ch, "c1", false, false, limiter.token(), None)
        .await
        .unwrap();

    for i in 0..4 {
        q.handle
            .publish(Arc::new(Message::new(format!("m{i}"), false)));
    }
    // Volume never grows without ack_required, so everything flows.
    for i in 0..4 {
        let (tag, m, _) = recv_delivery(&mut rx).await;
        assert!(tag.is_none());
        assert_eq!(m.payload().as_ref(), format!("m{i}").as_bytes());
    }
}

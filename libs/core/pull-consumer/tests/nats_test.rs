//! The same session scenarios against a real NATS server.
//!
//! Run with `cargo test -p pull-consumer --features nats -- --ignored`
//! (needs docker for testcontainers).
#![cfg(feature = "nats")]

use bytes::Bytes;
use pull_consumer::*;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestNats};

async fn seeded(nats: &TestNats, names: &TestDataBuilder, count: usize) -> (Arc<dyn Broker>, String, String) {
    let broker: Arc<dyn Broker> = Arc::new(NatsBroker::new(nats.client()));
    let stream = names.stream("EVENTS");
    let subject = names.subject("event");
    broker
        .create_stream(StreamConfig::new(&stream, [format!("{}.>", subject)]))
        .await
        .unwrap();

    let payload = Bytes::from(TestDataBuilder::payload(50));
    for i in 1..=count {
        broker
            .publish(&format!("{}.{}", subject, i), payload.clone())
            .await
            .unwrap();
    }
    (broker, stream, subject)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_batches_and_timeout() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_batches_and_timeout");
    let (broker, stream, _) = seeded(&nats, &names, 5).await;

    let session = ConsumerSession::open(broker, &stream, None, Some("event-consumer"))
        .await
        .unwrap();

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let batch = session.fetch(BatchRequest::new(2)).await.unwrap();
        sizes.push(batch.len());
        for message in batch {
            session.ack(&message).await.unwrap();
        }
    }
    assert_eq!(sizes, vec![2, 2, 1]);

    let extra = session
        .fetch(BatchRequest::new(2).with_timeout(Duration::from_millis(500)))
        .await
        .unwrap();
    assert!(extra.is_drained());

    session.delete().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_no_wait_and_byte_limit() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_no_wait_and_byte_limit");
    let (broker, stream, _) = seeded(&nats, &names, 20).await;

    let session = ConsumerSession::open(broker, &stream, None, None).await.unwrap();
    let batch = session
        .fetch(BatchRequest::new(1000).with_max_bytes(300))
        .await
        .unwrap();
    assert!(!batch.is_empty());
    assert!(batch.len() < 1000);
    assert!(batch.total_bytes() <= 300);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_balanced_pair_on_nats() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_balanced_pair_on_nats");
    let (broker, stream, _) = seeded(&nats, &names, 10).await;

    let group = BalancedGroup::open(broker, &stream, ConsumerConfig::durable(names.consumer("shared")), 2)
        .await
        .unwrap();
    let report = group.round_robin_single().await.unwrap();

    assert_eq!(report.total(), 10);
    assert!(!report.has_duplicates());
    group.sessions()[0].delete().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_ack_sync_clears_pending() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_ack_sync_clears_pending");
    let (broker, stream, _) = seeded(&nats, &names, 2).await;

    let session = ConsumerSession::open(broker, &stream, None, Some("double-ack"))
        .await
        .unwrap();
    let batch = session.fetch(BatchRequest::new(2)).await.unwrap();
    for message in &batch.messages {
        session.ack_sync(message).await.unwrap();
    }

    let info = session.info().await.unwrap();
    assert_eq!(info.num_ack_pending, 0);
    assert_eq!(info.num_pending, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_waiting_fetch_returns_after_first_message() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_waiting_fetch_returns_after_first_message");
    let (broker, stream, subject) = seeded(&nats, &names, 0).await;

    let session = ConsumerSession::open(broker.clone(), &stream, None, None)
        .await
        .unwrap();
    let publisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        broker
            .publish(&format!("{}.late", subject), Bytes::from_static(b"late"))
            .await
            .unwrap();
    });

    let start = std::time::Instant::now();
    let batch = session
        .fetch(BatchRequest::new(10).with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
    publisher.await.unwrap();
}

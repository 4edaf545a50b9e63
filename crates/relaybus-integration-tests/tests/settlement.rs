//! Integration tests for peek-lock delivery and settlement
//!
//! These tests verify:
//! - Completed messages are never delivered again
//! - Abandoned and expired leases lead to redelivery with a higher count
//! - Competing receivers never hold the same message at once
//! - Deferred messages are only reachable by sequence number

mod common;

use common::{body, drain, text_messages, TestBus};
use relaybus_client::{AbandonOutcome, ClientError, EntityProperties, ReceiverOptions};
use std::collections::HashSet;
use std::time::Duration;

/// Verify that every sent message is delivered and completed exactly once
#[tokio::test(start_paused = true)]
async fn test_send_receive_complete() {
    // Arrange
    let bus = TestBus::new().await;
    let queue = bus.queue("orders", EntityProperties::default());
    bus.send_all(&queue, text_messages("order", 20)).await;

    // Act
    let mut receiver = bus.receiver(&queue).await;
    let messages = drain(&mut receiver, 20).await;
    for message in &messages {
        receiver.complete(message).await.unwrap();
    }

    // Assert
    let bodies: Vec<String> = messages.iter().map(body).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("order-{}", i)).collect();
    assert_eq!(bodies, expected);
    assert_eq!(bus.count(&queue), 0);
    assert!(receiver
        .receive(1, Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());
}

/// Verify that a crashed consumer's messages are redelivered to another
#[tokio::test(start_paused = true)]
async fn test_lease_expiry_redelivers_to_other_consumer() {
    let bus = TestBus::new().await;
    let queue = bus.queue(
        "orders",
        EntityProperties::default().with_lock_duration(Duration::from_secs(30)),
    );
    bus.send_all(&queue, text_messages("order", 3)).await;

    // A consumer takes everything and then disappears
    let mut crashed = bus.receiver(&queue).await;
    assert_eq!(drain(&mut crashed, 3).await.len(), 3);
    drop(crashed);

    let other = bus.connect().await;
    let mut survivor = other
        .create_receiver(queue.clone(), ReceiverOptions::default())
        .await
        .unwrap();

    // Nothing is available until the leases lapse
    let started = tokio::time::Instant::now();
    let redelivered = survivor
        .receive(3, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(29));
    assert!(started.elapsed() < Duration::from_secs(60));

    assert_eq!(redelivered.len(), 3);
    for message in &redelivered {
        assert_eq!(message.delivery_count, 1);
        survivor.complete(message).await.unwrap();
    }
}

/// Verify that competing receivers partition the queue between them
#[tokio::test(start_paused = true)]
async fn test_competing_receivers_do_not_share_leases() {
    let bus = TestBus::new().await;
    let queue = bus.queue("orders", EntityProperties::default());
    bus.send_all(&queue, text_messages("order", 10)).await;

    let mut a = bus.receiver(&queue).await;
    let mut b = bus.receiver(&queue).await;

    let from_a = a.receive(5, Duration::from_secs(1)).await.unwrap();
    let from_b = b.receive(10, Duration::from_secs(1)).await.unwrap();

    let seen_a: HashSet<u64> = from_a.iter().map(|m| m.sequence_number).collect();
    let seen_b: HashSet<u64> = from_b.iter().map(|m| m.sequence_number).collect();
    assert_eq!(seen_a.len() + seen_b.len(), 10);
    assert!(seen_a.is_disjoint(&seen_b));

    // A lock token is only honoured by the receiver that holds it
    let stolen = b.complete(&from_a[0]).await;
    assert!(matches!(stolen, Err(ClientError::LockLost { .. })));
}

/// Verify that abandon makes a message immediately available again
#[tokio::test(start_paused = true)]
async fn test_abandon_redelivers_immediately() {
    let bus = TestBus::new().await;
    let queue = bus.queue("orders", EntityProperties::default());
    bus.send_all(&queue, text_messages("order", 1)).await;

    let mut receiver = bus.receiver(&queue).await;
    let first = receiver.receive_message().await.unwrap().unwrap();
    let outcome = receiver.abandon(&first).await.unwrap();
    assert_eq!(outcome, AbandonOutcome::Redelivered { delivery_count: 1 });

    let started = tokio::time::Instant::now();
    let again = receiver.receive_message().await.unwrap().unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(again.sequence_number, first.sequence_number);
    assert_eq!(again.delivery_count, 1);
}

/// Verify the deferral workflow: park a message and pick it up later by sequence number
#[tokio::test(start_paused = true)]
async fn test_deferred_message_workflow() {
    let bus = TestBus::new().await;
    let queue = bus.queue("orders", EntityProperties::default());
    bus.send_all(&queue, text_messages("order", 2)).await;

    let mut receiver = bus.receiver(&queue).await;
    let early = receiver.receive_message().await.unwrap().unwrap();
    let parked = receiver.defer(&early).await.unwrap();

    // Deferred messages are visible to peek but not to receive
    let peeked = receiver.peek_messages_from(1, 10).await.unwrap();
    assert_eq!(peeked.len(), 2);

    let next = receiver.receive_message().await.unwrap().unwrap();
    receiver.complete(&next).await.unwrap();
    assert!(receiver
        .receive(1, Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());

    let resumed = receiver.receive_deferred(&[parked]).await.unwrap();
    assert_eq!(body(&resumed[0]), "order-0");
    receiver.complete(&resumed[0]).await.unwrap();
    assert_eq!(bus.count(&queue), 0);
}

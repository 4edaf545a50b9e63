//! Integration tests for dead-lettering
//!
//! These tests verify:
//! - Poison messages move to the dead-letter sub-queue after too many deliveries
//! - Lease expiry counts as a failed delivery
//! - Expired messages are dead-lettered when the entity asks for it
//! - Dead-lettered messages can be inspected, resubmitted and drained

mod common;

use common::{body, text_messages, TestBus};
use relaybus_client::{
    AbandonOutcome, ClientError, DeadLetterPolicy, DeadLetterReason, DeliveryDisposition,
    EntityProperties, Message,
};
use std::time::Duration;

/// Verify that the broker applies the same threshold as the client-side policy
#[tokio::test(start_paused = true)]
async fn test_poison_message_reaches_dead_letter_queue() {
    // Arrange
    let bus = TestBus::new().await;
    let queue = bus.queue(
        "payments",
        EntityProperties::default().with_max_delivery_count(5),
    );
    bus.send_all(&queue, vec![Message::new("not json")]).await;
    let policy = DeadLetterPolicy::new(5);

    // Act: fail the message until the broker gives up on it
    let mut receiver = bus.receiver(&queue).await;
    loop {
        let Some(message) = receiver.receive_message().await.unwrap() else {
            panic!("message disappeared before being dead-lettered");
        };
        let expected = policy.on_delivery_failure(message.delivery_count);

        let outcome = receiver.abandon(&message).await.unwrap();
        match (outcome, expected) {
            (
                AbandonOutcome::Redelivered { delivery_count },
                DeliveryDisposition::Redeliver { delivery_count: predicted },
            ) => assert_eq!(delivery_count, predicted),
            (
                AbandonOutcome::DeadLettered { delivery_count },
                DeliveryDisposition::DeadLetter { delivery_count: predicted },
            ) => {
                assert_eq!(delivery_count, predicted);
                break;
            }
            (outcome, expected) => panic!("broker chose {:?}, policy chose {:?}", outcome, expected),
        }
    }

    // Assert
    assert_eq!(bus.count(&queue), 0);
    let mut dead_letters = bus.receiver(&queue.dead_letter()).await;
    let dead = dead_letters.receive_message().await.unwrap().unwrap();
    assert_eq!(body(&dead), "not json");
    assert_eq!(dead.delivery_count, 6);
    assert_eq!(
        dead.dead_letter_reason.as_deref(),
        Some(DeadLetterReason::MaxDeliveryCountExceeded.as_str())
    );
}

/// Verify that a consumer that keeps crashing mid-processing also trips the threshold
#[tokio::test(start_paused = true)]
async fn test_lease_expiry_counts_as_failed_delivery() {
    let bus = TestBus::new().await;
    let queue = bus.queue(
        "payments",
        EntityProperties::default()
            .with_max_delivery_count(2)
            .with_lock_duration(Duration::from_secs(5)),
    );
    bus.send_all(&queue, text_messages("payment", 1)).await;

    let mut receiver = bus.receiver(&queue).await;
    for expected_count in 0..3 {
        let message = receiver.receive_message().await.unwrap().unwrap();
        assert_eq!(message.delivery_count, expected_count);
        tokio::time::advance(Duration::from_secs(6)).await;
    }

    assert_eq!(bus.count(&queue), 0);
    assert_eq!(bus.count(&queue.dead_letter()), 1);
}

/// Verify that expired messages are dead-lettered with the expiry reason
#[tokio::test(start_paused = true)]
async fn test_expired_message_is_dead_lettered() {
    let bus = TestBus::new().await;
    let queue = bus.queue(
        "notifications",
        EntityProperties::default().with_dead_lettering_on_message_expiration(),
    );
    bus.send_all(
        &queue,
        vec![
            Message::new("stale").with_ttl(Duration::from_secs(10)),
            Message::new("fresh"),
        ],
    )
    .await;

    tokio::time::advance(Duration::from_secs(11)).await;

    let mut receiver = bus.receiver(&queue).await;
    let live = receiver.receive(10, Duration::from_secs(1)).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(body(&live[0]), "fresh");

    let mut dead_letters = bus.receiver(&queue.dead_letter()).await;
    let dead = dead_letters.receive_message().await.unwrap().unwrap();
    assert_eq!(body(&dead), "stale");
    assert_eq!(
        dead.dead_letter_reason.as_deref(),
        Some(DeadLetterReason::TtlExpired.as_str())
    );
}

/// Verify the operator workflow: inspect, resubmit to the main queue, then drain
#[tokio::test(start_paused = true)]
async fn test_resubmit_from_dead_letter_queue() {
    let bus = TestBus::new().await;
    let queue = bus.queue("payments", EntityProperties::default());
    bus.send_all(
        &queue,
        vec![Message::new("retry me").with_property("tenant", "acme")],
    )
    .await;

    let mut receiver = bus.receiver(&queue).await;
    let message = receiver.receive_message().await.unwrap().unwrap();
    receiver
        .dead_letter(&message, "DownstreamUnavailable", Some("ledger offline".to_string()))
        .await
        .unwrap();

    // Inspect without locking
    let mut dead_letters = bus.receiver(&queue.dead_letter()).await;
    let peeked = dead_letters.peek_messages(10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(
        peeked[0].dead_letter_description.as_deref(),
        Some("ledger offline")
    );

    // Dead-lettering again from the dead-letter queue is not allowed
    let dead = dead_letters.receive_message().await.unwrap().unwrap();
    assert!(matches!(
        dead_letters.dead_letter(&dead, "again", None).await,
        Err(ClientError::InvalidOperation { .. })
    ));

    // Resubmit a copy and remove the original
    let mut sender = bus.connection.create_sender(queue.clone()).unwrap();
    sender.send(dead.message()).await.unwrap();
    dead_letters.complete(&dead).await.unwrap();

    let resubmitted = receiver.receive_message().await.unwrap().unwrap();
    assert_eq!(body(&resubmitted), "retry me");
    assert_eq!(resubmitted.property("tenant").map(|v| v.to_string()).as_deref(), Some("acme"));
    assert_eq!(resubmitted.delivery_count, 0);
    assert_eq!(bus.count(&queue.dead_letter()), 0);
}

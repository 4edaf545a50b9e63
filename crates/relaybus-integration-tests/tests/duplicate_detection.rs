//! Integration tests for duplicate detection
//!
//! These tests verify:
//! - Resending a message id inside the detection window is accepted but dropped
//! - The same id is accepted again once the window has passed
//! - Entities without a window keep every copy

mod common;

use common::TestBus;
use relaybus_client::{EntityProperties, Message, MessageId};
use std::time::Duration;

fn order(id: &str) -> Message {
    let message_id: MessageId = id.parse().unwrap();
    Message::new(format!("order {}", id)).with_message_id(message_id)
}

/// Verify that a producer retrying after a lost acknowledgement does not create duplicates
#[tokio::test(start_paused = true)]
async fn test_resend_inside_window_is_dropped() {
    let bus = TestBus::new().await;
    let queue = bus.queue(
        "orders",
        EntityProperties::default().with_duplicate_detection(Duration::from_secs(60)),
    );
    let mut sender = bus.connection.create_sender(queue.clone()).unwrap();

    let first = sender.send(order("o-1")).await.unwrap();
    let retry = sender.send(order("o-1")).await.unwrap();

    // Both sends succeed and report the same id
    assert_eq!(first.message_ids, retry.message_ids);
    assert_eq!(bus.count(&queue), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    sender.send(order("o-1")).await.unwrap();
    assert_eq!(bus.count(&queue), 2);
}

/// Verify that without a window every copy is kept
#[tokio::test(start_paused = true)]
async fn test_no_window_keeps_duplicates() {
    let bus = TestBus::new().await;
    let queue = bus.queue("orders", EntityProperties::default());
    let mut sender = bus.connection.create_sender(queue.clone()).unwrap();

    sender.send(order("o-1")).await.unwrap();
    sender.send(order("o-1")).await.unwrap();

    assert_eq!(bus.count(&queue), 2);
}

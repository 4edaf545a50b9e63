//! Tests for senders and message batches.

use super::*;
use crate::config::{ConnectionConfig, EntityProperties};
use crate::connection::Connection;
use crate::transport::InMemoryTransport;

async fn sender_for(config: ConnectionConfig) -> (Arc<InMemoryTransport>, EntityPath, Sender) {
    let transport = Arc::new(InMemoryTransport::new());
    let queue = transport
        .create_queue("orders", EntityProperties::default())
        .unwrap();
    let connection = Connection::open(transport.clone(), config).await.unwrap();
    let sender = connection.create_sender(queue.clone()).unwrap();
    (transport, queue, sender)
}

fn small_limits() -> ConnectionConfig {
    ConnectionConfig {
        max_message_size: 200,
        max_batch_size: 400,
        ..Default::default()
    }
}

// ============================================================================
// MessageBatch Tests
// ============================================================================

mod batch {
    use super::*;

    #[test]
    fn test_try_add_tracks_size() {
        let mut batch = MessageBatch::new(1024, 1024);
        let message = Message::new("hello");
        let size = message.encoded_size();

        batch.try_add(message).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size_in_bytes(), size);
        assert_eq!(batch.max_size_in_bytes(), 1024);
    }

    #[test]
    fn test_try_add_returns_overflowing_message() {
        let mut batch = MessageBatch::new(100, 100);
        batch.try_add(Message::new(vec![0u8; 50])).unwrap();

        let overflow = Message::new(vec![1u8; 50]).with_subject("second".to_string());
        let rejected = batch.try_add(overflow).unwrap_err();

        // The caller gets the same message back to place in a new batch
        assert_eq!(rejected.subject.as_deref(), Some("second"));
        assert_eq!(batch.len(), 1);

        let mut next = MessageBatch::new(100, 100);
        assert!(next.try_add(rejected).is_ok());
    }

    #[test]
    fn test_message_larger_than_message_limit_never_fits() {
        let mut batch = MessageBatch::new(1000, 100);
        assert!(batch.try_add(Message::new(vec![0u8; 200])).is_err());
        assert!(batch.is_empty());
    }
}

// ============================================================================
// Sending
// ============================================================================

mod sending {
    use super::*;

    #[tokio::test]
    async fn test_send_single_message() {
        let (transport, queue, mut sender) = sender_for(ConnectionConfig::default()).await;

        let ack = sender
            .send(Message::new("hello").with_message_id("m-1".parse().unwrap()))
            .await
            .unwrap();

        assert_eq!(ack.message_ids.len(), 1);
        assert_eq!(ack.message_ids[0].as_str(), "m-1");
        assert_eq!(transport.message_count(&queue).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_assigns_message_id_when_absent() {
        let (_transport, _queue, mut sender) = sender_for(ConnectionConfig::default()).await;

        let ack = sender.send(Message::new("hello")).await.unwrap();
        assert!(!ack.message_ids[0].as_str().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_without_round_trip() {
        let (transport, _queue, mut sender) = sender_for(small_limits()).await;

        let result = sender.send(Message::new(vec![0u8; 500])).await;

        assert!(matches!(
            result,
            Err(ClientError::SizeExceeded { max_size: 200, .. })
        ));
        assert_eq!(transport.stats().send_calls, 0);
    }

    #[tokio::test]
    async fn test_send_batch_is_one_round_trip() {
        let (transport, queue, mut sender) = sender_for(ConnectionConfig::default()).await;

        let mut batch = sender.create_batch();
        for i in 0..5 {
            batch.try_add(Message::new(format!("message {}", i))).unwrap();
        }
        let ack = sender.send_batch(batch).await.unwrap();

        assert_eq!(ack.message_ids.len(), 5);
        assert_eq!(transport.stats().send_calls, 1);
        assert_eq!(transport.message_count(&queue).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let (transport, _queue, mut sender) = sender_for(ConnectionConfig::default()).await;

        let ack = sender.send_batch(sender.create_batch()).await.unwrap();

        assert!(ack.message_ids.is_empty());
        assert_eq!(transport.stats().send_calls, 0);
    }

    #[tokio::test]
    async fn test_send_messages_that_do_not_fit_fails() {
        let (transport, _queue, mut sender) = sender_for(small_limits()).await;

        let messages = (0..5).map(|_| Message::new(vec![0u8; 100])).collect();
        let result = sender.send_messages(messages).await;

        assert!(matches!(
            result,
            Err(ClientError::SizeExceeded { max_size: 400, .. })
        ));
        assert_eq!(transport.stats().send_calls, 0);
    }

    #[tokio::test]
    async fn test_batch_limit_cannot_exceed_connection_limit() {
        let (_transport, _queue, sender) = sender_for(small_limits()).await;

        assert!(sender.create_batch_with_limit(1000).is_err());
        assert!(sender.create_batch_with_limit(0).is_err());
        assert_eq!(
            sender.create_batch_with_limit(300).unwrap().max_size_in_bytes(),
            300
        );
    }

    #[tokio::test]
    async fn test_transient_broker_failure_surfaces() {
        let (transport, _queue, mut sender) = sender_for(ConnectionConfig::default()).await;
        transport.fail_next_operations(1);

        let result = sender.send(Message::new("x")).await;
        assert!(result.unwrap_err().is_transient());

        // Business-level retry stays with the caller
        assert!(sender.send(Message::new("x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_sender_rejects_sends() {
        let (_transport, _queue, mut sender) = sender_for(ConnectionConfig::default()).await;
        sender.close();

        assert!(matches!(
            sender.send(Message::new("x")).await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}

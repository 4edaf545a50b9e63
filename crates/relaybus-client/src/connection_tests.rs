//! Tests for the connection manager.

use super::*;
use crate::config::Credential;
use crate::message::Message;
use crate::transport::InMemoryTransport;
use std::time::Duration;

async fn open(transport: &Arc<InMemoryTransport>) -> Connection {
    Connection::open(transport.clone(), ConnectionConfig::default())
        .await
        .unwrap()
}

// ============================================================================
// Opening
// ============================================================================

mod opening {
    use super::*;

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let transport = Arc::new(InMemoryTransport::new());
        let config = ConnectionConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };

        let result = Connection::open(transport, config).await;
        assert!(matches!(result, Err(ClientError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_open_with_wrong_credential_is_unauthorized() {
        let transport = Arc::new(InMemoryTransport::new().with_credential(
            Credential::SharedAccessKey {
                key_name: "RootManageSharedAccessKey".to_string(),
                key: "secret".to_string(),
            },
        ));

        let result = Connection::open(transport, ConnectionConfig::default()).await;
        let error = result.err().unwrap();
        assert!(matches!(error, ClientError::Unauthorized { .. }));
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn test_open_from_settings() {
        let transport = Arc::new(InMemoryTransport::new());
        let settings = ClientSettings {
            connection: ConnectionConfig::default(),
            connection_string: None,
            entity: "orders".to_string(),
            receiver: ReceiverOptions::default(),
        };

        let connection = Connection::from_settings(transport, &settings).await.unwrap();
        assert_eq!(connection.config().endpoint, "sb://localhost/");
    }
}

// ============================================================================
// Handle Creation
// ============================================================================

mod handles {
    use super::*;

    #[tokio::test]
    async fn test_sender_only_for_queues_and_topics() {
        let transport = Arc::new(InMemoryTransport::new());
        let queue = transport
            .create_queue("orders", EntityProperties::default())
            .unwrap();
        let connection = open(&transport).await;

        assert!(connection.create_sender(queue.clone()).is_ok());
        assert!(matches!(
            connection.create_sender(queue.dead_letter()),
            Err(ClientError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_receiver_for_missing_entity_not_found() {
        let transport = Arc::new(InMemoryTransport::new());
        let connection = open(&transport).await;

        let result = connection
            .create_receiver("missing".parse().unwrap(), ReceiverOptions::default())
            .await;
        assert!(matches!(result, Err(ClientError::EntityNotFound { .. })));
    }

    #[tokio::test]
    async fn test_receiver_reads_entity_properties() {
        let transport = Arc::new(InMemoryTransport::new());
        let queue = transport
            .create_queue(
                "orders",
                EntityProperties::default().with_max_delivery_count(4),
            )
            .unwrap();
        let connection = open(&transport).await;

        let receiver = connection
            .create_receiver(queue, ReceiverOptions::default().with_identifier("worker"))
            .await
            .unwrap();

        assert_eq!(receiver.properties().max_delivery_count, 4);
        assert!(receiver.identifier().starts_with("worker-"));
    }

    #[tokio::test]
    async fn test_session_entities_need_session_router() {
        let transport = Arc::new(InMemoryTransport::new());
        let sessions = transport
            .create_queue("sessions", EntityProperties::default().with_sessions())
            .unwrap();
        let plain = transport
            .create_queue("plain", EntityProperties::default())
            .unwrap();
        let connection = open(&transport).await;

        assert!(matches!(
            connection
                .create_receiver(sessions.clone(), ReceiverOptions::default())
                .await,
            Err(ClientError::InvalidOperation { .. })
        ));
        assert!(connection
            .create_receiver(sessions.dead_letter(), ReceiverOptions::default())
            .await
            .is_ok());
        assert!(connection
            .create_session_router(sessions, ReceiverOptions::default())
            .await
            .is_ok());
        assert!(matches!(
            connection
                .create_session_router(plain, ReceiverOptions::default())
                .await,
            Err(ClientError::InvalidOperation { .. })
        ));
    }
}

// ============================================================================
// Closing and Deadlines
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_close_invalidates_derived_handles() {
        let transport = Arc::new(InMemoryTransport::new());
        let queue = transport
            .create_queue("orders", EntityProperties::default())
            .unwrap();
        let connection = open(&transport).await;
        let mut sender = connection.create_sender(queue.clone()).unwrap();

        connection.clone().close();

        assert!(connection.is_closed());
        assert!(matches!(
            sender.send(Message::new("late")).await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.create_sender(queue),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_blocked_receive() {
        let transport = Arc::new(InMemoryTransport::new());
        let queue = transport
            .create_queue("orders", EntityProperties::default())
            .unwrap();
        let connection = open(&transport).await;
        let mut receiver = connection
            .create_receiver(queue, ReceiverOptions::default())
            .await
            .unwrap();

        let closer = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            closer.close();
        });

        let started = tokio::time::Instant::now();
        let result = receiver.receive(1, Duration::from_secs(60)).await;

        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_deadline_is_transient() {
        let transport = Arc::new(InMemoryTransport::new());
        let connection = open(&transport).await;

        let result: Result<(), ClientError> = connection
            .inner
            .round_trip("send", std::future::pending())
            .await;

        let error = result.unwrap_err();
        assert!(error.is_transient());
        assert!(error.to_string().contains("send timed out"));
    }
}

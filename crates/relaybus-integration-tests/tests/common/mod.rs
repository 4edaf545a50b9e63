//! Common test utilities for relaybus integration tests
//!
//! This module provides:
//! - Tracing setup honouring `RUST_LOG`
//! - A bus fixture wrapping the in-memory broker and an open connection
//! - Message builders shared across scenarios

use relaybus_client::{
    Connection, ConnectionConfig, EntityPath, EntityProperties, InMemoryTransport, Message,
    ReceivedMessage, Receiver, ReceiverOptions, SessionId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once per process
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Bus Fixture
// ============================================================================

/// In-memory broker plus one open connection
#[allow(dead_code)]
pub struct TestBus {
    pub transport: Arc<InMemoryTransport>,
    pub connection: Connection,
}

impl TestBus {
    #[allow(dead_code)]
    pub async fn new() -> Self {
        init_tracing();
        let transport = Arc::new(InMemoryTransport::new());
        let connection = Connection::open(transport.clone(), ConnectionConfig::default())
            .await
            .expect("in-memory connection should open");

        Self {
            transport,
            connection,
        }
    }

    /// Open a second, independent connection to the same broker
    #[allow(dead_code)]
    pub async fn connect(&self) -> Connection {
        Connection::open(self.transport.clone(), ConnectionConfig::default())
            .await
            .expect("in-memory connection should open")
    }

    #[allow(dead_code)]
    pub fn queue(&self, name: &str, properties: EntityProperties) -> EntityPath {
        self.transport
            .create_queue(name, properties)
            .expect("queue should be created")
    }

    #[allow(dead_code)]
    pub async fn receiver(&self, entity: &EntityPath) -> Receiver {
        self.connection
            .create_receiver(entity.clone(), ReceiverOptions::default())
            .await
            .expect("receiver should be created")
    }

    #[allow(dead_code)]
    pub async fn send_all(&self, entity: &EntityPath, messages: Vec<Message>) {
        let mut sender = self
            .connection
            .create_sender(entity.clone())
            .expect("sender should be created");
        sender
            .send_messages(messages)
            .await
            .expect("messages should be accepted");
    }

    #[allow(dead_code)]
    pub fn count(&self, entity: &EntityPath) -> usize {
        self.transport
            .message_count(entity)
            .expect("entity should exist")
    }
}

// ============================================================================
// Message Builders
// ============================================================================

#[allow(dead_code)]
pub fn text_messages(prefix: &str, count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| Message::new(format!("{}-{}", prefix, i)))
        .collect()
}

#[allow(dead_code)]
pub fn session_message(session_id: &str, body: &str) -> Message {
    let session_id: SessionId = session_id.parse().expect("valid session id");
    Message::new(body.to_string()).with_session_id(session_id)
}

#[allow(dead_code)]
pub fn body(message: &ReceivedMessage) -> String {
    message
        .body_as_str()
        .expect("utf-8 body")
        .to_string()
}

/// Receive until `expected` messages arrive or a receive comes back empty
#[allow(dead_code)]
pub async fn drain(receiver: &mut Receiver, expected: usize) -> Vec<ReceivedMessage> {
    let mut received = Vec::new();
    while received.len() < expected {
        let batch = receiver
            .receive((expected - received.len()) as u32, Duration::from_secs(1))
            .await
            .expect("receive should succeed");
        if batch.is_empty() {
            break;
        }
        received.extend(batch);
    }
    received
}

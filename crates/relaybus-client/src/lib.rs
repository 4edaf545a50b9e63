//! # Relaybus Client
//!
//! At-least-once, peek-lock messaging client core.
//!
//! This library provides:
//! - Senders with size-bounded batches
//! - Peek-lock receivers with settlement (complete, abandon, dead-letter, defer)
//! - Delivery-count driven dead-lettering
//! - Session-affinity receive with exclusive session locks and FIFO order
//! - A transport seam plus an in-memory broker for tests and local development
//!
//! ## Module Organization
//!
//! - [`connection`] - Connection manager and handle factory
//! - [`sender`] / [`receiver`] / [`session`] - Messaging handles
//! - [`dead_letter`] - Dead-letter policy
//! - [`transport`] - Broker transport trait and in-memory broker
//! - [`config`] - Connection, entity and receiver settings
//! - [`error`] - Error types for all client operations

pub mod config;
pub mod connection;
pub mod dead_letter;
pub mod entity;
pub mod error;
pub mod filter;
pub mod message;
pub mod processor;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod session;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{ClientSettings, ConnectionConfig, Credential, EntityProperties, ReceiverOptions};
pub use connection::Connection;
pub use dead_letter::{DeadLetterPolicy, DeadLetterReason, DeliveryDisposition};
pub use entity::{EntityName, EntityPath};
pub use error::{ClientError, ConfigurationError, SerializationError, ValidationError};
pub use filter::SubscriptionFilter;
pub use message::{
    LockToken, Message, MessageId, MessageState, PropertyValue, ReceivedMessage, SessionId,
    Timestamp,
};
pub use processor::{MessageAction, MessageProcessor, ProcessorOptions, ProcessorStats};
pub use receiver::{AbandonOutcome, Receiver};
pub use retry::RetryPolicy;
pub use sender::{MessageBatch, SendAck, Sender};
pub use session::{SessionReceiver, SessionRouter};
pub use transport::{InMemoryTransport, Transport};

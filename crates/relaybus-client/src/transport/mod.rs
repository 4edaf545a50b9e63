//! Transport seam between the client core and a broker.
//!
//! The wire protocol is an external collaborator. Anything able to send,
//! lease, settle and lock sessions over a reliable, authenticated connection
//! can sit behind [`Transport`]. Implementations must classify failures into
//! [`ClientError`] variants so the core can tell transient from fatal errors.
//!
//! [`InMemoryTransport`] is a complete broker simulation used for tests and
//! local development.

use crate::config::{Credential, EntityProperties};
use crate::entity::EntityPath;
use crate::error::ClientError;
use crate::message::{LockToken, Message, MessageId, ReceivedMessage, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

pub mod memory;

pub use memory::{InMemoryTransport, TransportStats};

/// Parameters of a peek-lock receive round trip
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub entity: EntityPath,
    /// Restricts the receive to one session; the caller must hold its lock
    pub session_id: Option<SessionId>,
    /// Identifier of the receiver that will hold the leases
    pub owner: String,
    pub max_count: u32,
    pub max_wait: Duration,
}

/// Disposition requested for a leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
    DeadLetter {
        reason: String,
        description: Option<String>,
    },
    Defer,
}

impl Settlement {
    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter { .. } => "dead_letter",
            Self::Defer => "defer",
        }
    }
}

/// Result reported by the broker for a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Completed,
    /// Message is `Active` again (or back in the deferred set)
    Abandoned { delivery_count: u32 },
    DeadLettered { delivery_count: u32 },
    Deferred { sequence_number: u64 },
}

/// Session lock granted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: SessionId,
    pub locked_until: Instant,
}

/// Interface implemented by broker transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate and open the underlying connection
    async fn open(&self, credential: &Credential) -> Result<(), ClientError>;

    /// Entity-level properties (lock duration, dead-letter threshold, session flag)
    async fn entity_properties(&self, entity: &EntityPath) -> Result<EntityProperties, ClientError>;

    /// Enqueue messages atomically. Returns the id of every message, including
    /// ones the broker dropped as duplicates.
    async fn send(
        &self,
        entity: &EntityPath,
        messages: Vec<Message>,
    ) -> Result<Vec<MessageId>, ClientError>;

    /// Lease up to `max_count` messages, waiting up to `max_wait` for the first.
    /// An empty result means the wait elapsed.
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>, ClientError>;

    /// Browse messages without locking them, starting at `from_sequence_number`
    async fn peek(
        &self,
        entity: &EntityPath,
        session_id: Option<&SessionId>,
        from_sequence_number: u64,
        max_count: u32,
    ) -> Result<Vec<ReceivedMessage>, ClientError>;

    /// Lease deferred messages by sequence number
    async fn receive_deferred(
        &self,
        entity: &EntityPath,
        session_id: Option<&SessionId>,
        owner: &str,
        sequence_numbers: &[u64],
    ) -> Result<Vec<ReceivedMessage>, ClientError>;

    /// Settle a message leased to `owner`. A token held by another owner is
    /// reported as `LockLost`.
    async fn settle(
        &self,
        entity: &EntityPath,
        owner: &str,
        lock_token: &LockToken,
        settlement: Settlement,
    ) -> Result<SettlementOutcome, ClientError>;

    /// Extend a lease held by `owner` by the entity's lock duration
    async fn renew_message_lock(
        &self,
        entity: &EntityPath,
        owner: &str,
        lock_token: &LockToken,
    ) -> Result<Instant, ClientError>;

    /// Lock a specific session; `SessionLocked` if another owner holds it
    async fn accept_session(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<SessionLease, ClientError>;

    /// Lock the unlocked session with the oldest active message, ignoring the
    /// sessions in `skip`. Waits up to `max_wait` and returns `Ok(None)` if
    /// none became available.
    async fn accept_next_session(
        &self,
        entity: &EntityPath,
        owner: &str,
        skip: &[SessionId],
        max_wait: Duration,
    ) -> Result<Option<SessionLease>, ClientError>;

    async fn renew_session_lock(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<Instant, ClientError>;

    /// Release a session lock; leased messages of the session are returned as failed deliveries
    async fn release_session(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<(), ClientError>;

    async fn get_session_state(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
    ) -> Result<Option<Bytes>, ClientError>;

    async fn set_session_state(
        &self,
        entity: &EntityPath,
        session_id: &SessionId,
        owner: &str,
        state: Option<Bytes>,
    ) -> Result<(), ClientError>;
}

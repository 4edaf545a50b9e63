//! Client error taxonomy.
//!
//! Every public operation returns [`ClientError`]. Only `Transient` failures
//! are retried by the client, and only for settlement transmission.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure or broker busy; safe to retry with backoff.
    #[error("Transient failure: {message}")]
    Transient { message: String },

    /// The lease behind a lock token expired, was settled, or never existed.
    #[error("Lock token {lock_token} is no longer valid")]
    LockLost { lock_token: String },

    #[error("Session '{session_id}' is held by another receiver")]
    SessionLocked { session_id: String },

    #[error("Lost the lock on session '{session_id}'")]
    SessionLockLost { session_id: String },

    #[error("Payload of {size} bytes exceeds the {max_size} byte limit")]
    SizeExceeded { size: usize, max_size: usize },

    #[error("No such entity: {entity}")]
    EntityNotFound { entity: String },

    #[error("Not authorized: {message}")]
    Unauthorized { message: String },

    #[error("No deferred message with sequence number {sequence_number}")]
    MessageNotFound { sequence_number: u64 },

    #[error("Operation not allowed: {message}")]
    InvalidOperation { message: String },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error(transparent)]
    SerializationError(#[from] SerializationError),

    #[error(transparent)]
    ConfigurationError(#[from] ConfigurationError),

    #[error(transparent)]
    ValidationError(#[from] ValidationError),
}

impl ClientError {
    /// Transient error for a broker round trip that missed its deadline.
    pub fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Transient {
            message: format!("{} timed out after {:?}", operation, after),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Errors that will fail the same way however often they are retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound { .. }
                | Self::Unauthorized { .. }
                | Self::SessionLocked { .. }
                | Self::ConfigurationError(_)
                | Self::ValidationError(_)
        )
    }

    /// The message or session has to be received again before it can be
    /// settled.
    pub fn requires_receive(&self) -> bool {
        matches!(self, Self::LockLost { .. } | Self::SessionLockLost { .. })
    }
}

/// Body encoding failures
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON body: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Body is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration key '{key}' is not set")]
    Missing { key: String },

    #[error("Could not load configuration: {message}")]
    Parsing { message: String },
}

/// Rejected identifier or option values
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Required { field: String },

    #[error("{field} is malformed: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("{field} is out of range: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

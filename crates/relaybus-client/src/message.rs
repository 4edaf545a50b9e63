//! Message types for send and receive operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

/// Fixed per-message framing cost used when sizing messages and batches.
pub const MESSAGE_OVERHEAD_BYTES: usize = 32;

/// Longest accepted message or session identifier, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 128;

fn check_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("{} bytes exceeds the {} byte limit", value.len(), MAX_IDENTIFIER_LEN),
        });
    }
    Ok(())
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a message, also used as the duplicate detection key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Random UUIDv4 identifier, used when the caller does not set one
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_identifier("message_id", s)?;
        Ok(Self(s.to_owned()))
    }
}

/// Name of an ordered message group; all messages carrying it are handled
/// by whichever receiver holds the session lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: String) -> Result<Self, ValidationError> {
        check_identifier("session_id", &id)?;

        if let Some(bad) = id.chars().find(|c| !c.is_ascii() || c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id".to_string(),
                message: format!("character {:?} is not printable ASCII", bad),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

/// Opaque handle for the lease on a received message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock instant recorded by the broker (enqueue and send times).
///
/// Lease deadlines use the monotonic `tokio::time::Instant` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<DateTime<Utc>>().map(Self)
    }
}

// ============================================================================
// Application Properties
// ============================================================================

/// Scalar value of an application property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Approximate encoded size in bytes
    fn encoded_size(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::String(s) => s.len(),
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub session_id: Option<SessionId>,
    pub body: Bytes,
    pub properties: HashMap<String, PropertyValue>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Message with the given payload and no metadata
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            session_id: None,
            body: body.into(),
            properties: HashMap::new(),
            correlation_id: None,
            content_type: None,
            subject: None,
            time_to_live: None,
        }
    }

    /// Serialize `value` as the body and tag the content type as JSON
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, SerializationError> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body).with_content_type("application/json".to_string()))
    }

    /// Set the message ID used for duplicate detection
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Route to a session; the entity must require sessions
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_content_type(mut self, content_type: String) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_subject(mut self, subject: String) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Expire the message this long after it is enqueued
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Approximate size of the message on the wire.
    ///
    /// Counts the body, identifiers, system properties and application
    /// properties plus a fixed framing overhead. Used for single message and
    /// batch size limits.
    pub fn encoded_size(&self) -> usize {
        let optional_len = |value: &Option<String>| value.as_ref().map_or(0, |v| v.len());

        let properties: usize = self
            .properties
            .iter()
            .map(|(key, value)| key.len() + value.encoded_size())
            .sum();

        MESSAGE_OVERHEAD_BYTES
            + self.body.len()
            + self.message_id.as_ref().map_or(0, |id| id.as_str().len())
            + self.session_id.as_ref().map_or(0, |id| id.as_str().len())
            + optional_len(&self.correlation_id)
            + optional_len(&self.content_type)
            + optional_len(&self.subject)
            + properties
    }
}

/// Lifecycle state of a message as observed by receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    /// Available for delivery
    Active,
    /// Leased to exactly one receiver
    Locked,
    /// Removed permanently
    Completed,
    /// Moved to the dead-letter sub-queue
    DeadLettered,
    /// Held aside; retrievable by sequence number only
    Deferred,
}

/// A message received from an entity with delivery metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub session_id: Option<SessionId>,
    pub body: Bytes,
    pub properties: HashMap<String, PropertyValue>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub sequence_number: u64,
    pub enqueued_at: Timestamp,
    pub delivery_count: u32,
    pub state: MessageState,
    /// `None` for peeked messages
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<Instant>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl ReceivedMessage {
    /// Rebuild a sendable message with the same id, body and metadata.
    ///
    /// Used to resubmit dead-lettered messages. The remaining time-to-live is
    /// not carried over.
    pub fn message(&self) -> Message {
        Message {
            message_id: Some(self.message_id.clone()),
            session_id: self.session_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            subject: self.subject.clone(),
            time_to_live: None,
        }
    }

    /// Body as UTF-8 text
    pub fn body_as_str(&self) -> Result<&str, SerializationError> {
        std::str::from_utf8(&self.body).map_err(|_| SerializationError::InvalidUtf8)
    }

    /// Decode a JSON body
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// True once `locked_until` has passed, or for a message with no lease
    pub fn is_lock_expired(&self) -> bool {
        match self.locked_until {
            Some(locked_until) => Instant::now() >= locked_until,
            None => true,
        }
    }

    /// Remaining lease time, zero when expired or unleased
    pub fn time_until_lock_expiry(&self) -> Duration {
        self.locked_until.map_or(Duration::ZERO, |until| {
            until.saturating_duration_since(Instant::now())
        })
    }

    /// Whether this delivery is already past a `max_count` budget
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }
}

//! Messaging entity names and addressing.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;

const SUBSCRIPTIONS_SEGMENT: &str = "/subscriptions/";
const DEAD_LETTER_SUFFIX: &str = "/$deadletterqueue";

/// Validated queue, topic or subscription name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName(String);

/// Longest accepted entity name, in bytes.
pub const MAX_ENTITY_NAME_LEN: usize = 260;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

impl EntityName {
    pub fn new(name: String) -> Result<Self, ValidationError> {
        let invalid = |message: String| ValidationError::InvalidFormat {
            field: "entity_name".to_string(),
            message,
        };

        if name.is_empty() || name.len() > MAX_ENTITY_NAME_LEN {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: format!("length {} not within 1..={}", name.len(), MAX_ENTITY_NAME_LEN),
            });
        }
        if let Some(bad) = name.chars().find(|c| !is_name_char(*c)) {
            return Err(invalid(format!("unexpected character {:?}", bad)));
        }
        // Hyphens separate words; they cannot lead, trail or repeat
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(invalid(format!("misplaced hyphen in '{}'", name)));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// The kind of entity a path addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Queue(EntityName),
    Topic(EntityName),
    Subscription {
        topic: EntityName,
        subscription: EntityName,
    },
}

/// Sub-queue selector for receive paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubQueue {
    Main,
    DeadLetter,
}

/// Address of a messaging entity, optionally pointing at its dead-letter sub-queue.
///
/// Senders address queues and topics; receivers address queues, subscriptions
/// and the dead-letter sub-queue of either.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityPath {
    kind: EntityKind,
    sub_queue: SubQueue,
}

impl EntityPath {
    pub fn queue(name: EntityName) -> Self {
        Self {
            kind: EntityKind::Queue(name),
            sub_queue: SubQueue::Main,
        }
    }

    pub fn topic(name: EntityName) -> Self {
        Self {
            kind: EntityKind::Topic(name),
            sub_queue: SubQueue::Main,
        }
    }

    pub fn subscription(topic: EntityName, subscription: EntityName) -> Self {
        Self {
            kind: EntityKind::Subscription {
                topic,
                subscription,
            },
            sub_queue: SubQueue::Main,
        }
    }

    /// Path of this entity's dead-letter sub-queue
    pub fn dead_letter(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            sub_queue: SubQueue::DeadLetter,
        }
    }

    /// Path of the entity that owns this sub-queue
    pub fn main(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            sub_queue: SubQueue::Main,
        }
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn sub_queue(&self) -> SubQueue {
        self.sub_queue
    }

    pub fn is_dead_letter(&self) -> bool {
        self.sub_queue == SubQueue::DeadLetter
    }

    /// Check whether messages can be sent to this path
    pub fn is_sendable(&self) -> bool {
        self.sub_queue == SubQueue::Main
            && matches!(self.kind, EntityKind::Queue(_) | EntityKind::Topic(_))
    }

    /// Check whether messages can be received from this path
    pub fn is_receivable(&self) -> bool {
        !matches!(self.kind, EntityKind::Topic(_))
    }
}

impl std::fmt::Display for EntityPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EntityKind::Queue(name) | EntityKind::Topic(name) => write!(f, "{}", name)?,
            EntityKind::Subscription {
                topic,
                subscription,
            } => write!(f, "{}{}{}", topic, SUBSCRIPTIONS_SEGMENT, subscription)?,
        }
        if self.is_dead_letter() {
            write!(f, "{}", DEAD_LETTER_SUFFIX)?;
        }
        Ok(())
    }
}

/// Parses `queue`, `topic/subscriptions/sub` and either with a
/// `/$deadletterqueue` suffix. A bare name is treated as a queue.
impl FromStr for EntityPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, sub_queue) = match s.strip_suffix(DEAD_LETTER_SUFFIX) {
            Some(base) => (base, SubQueue::DeadLetter),
            None => (s, SubQueue::Main),
        };

        let kind = match base.split_once(SUBSCRIPTIONS_SEGMENT) {
            Some((topic, subscription)) => EntityKind::Subscription {
                topic: topic.parse()?,
                subscription: subscription.parse()?,
            },
            None => EntityKind::Queue(base.parse()?),
        };

        Ok(Self { kind, sub_queue })
    }
}

//! Subscription filters applied when a topic fans messages out.

use crate::message::{Message, PropertyValue};
use serde::{Deserialize, Serialize};

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;

/// Rule deciding whether a subscription receives a copy of a topic message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    /// Every message matches
    #[default]
    True,
    /// No message matches
    False,
    /// Application property `name` equals `value`
    PropertyEquals { name: String, value: PropertyValue },
    /// System correlation id equals `correlation_id`
    CorrelationId { correlation_id: String },
    /// Every nested filter matches
    All { filters: Vec<SubscriptionFilter> },
}

impl SubscriptionFilter {
    pub fn property_equals(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self::PropertyEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn correlation_id(correlation_id: impl Into<String>) -> Self {
        Self::CorrelationId {
            correlation_id: correlation_id.into(),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::PropertyEquals { name, value } => message.properties.get(name) == Some(value),
            Self::CorrelationId { correlation_id } => {
                message.correlation_id.as_deref() == Some(correlation_id.as_str())
            }
            Self::All { filters } => filters.iter().all(|f| f.matches(message)),
        }
    }
}

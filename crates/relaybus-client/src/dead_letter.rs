//! Dead-letter policy.
//!
//! The decision is a pure function of the message's delivery count and the
//! entity's `max_delivery_count`. It runs whenever a lease ends without
//! completion: explicit abandon, lease expiry, or a session being released
//! while it still holds leased messages.

use serde::{Deserialize, Serialize};

#[cfg(test)]
#[path = "dead_letter_tests.rs"]
mod tests;

/// Delivery attempts allowed when an entity does not override the threshold.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// What happens to a message whose lease ended without completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    /// Return to `Active` with the incremented count
    Redeliver { delivery_count: u32 },
    /// Move to the dead-letter sub-queue with the incremented count
    DeadLetter { delivery_count: u32 },
}

impl DeliveryDisposition {
    pub fn delivery_count(&self) -> u32 {
        match self {
            Self::Redeliver { delivery_count } | Self::DeadLetter { delivery_count } => {
                *delivery_count
            }
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }
}

/// Threshold policy moving repeatedly failing messages to the dead-letter sub-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    max_delivery_count: u32,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELIVERY_COUNT)
    }
}

impl DeadLetterPolicy {
    pub fn new(max_delivery_count: u32) -> Self {
        Self { max_delivery_count }
    }

    pub fn max_delivery_count(&self) -> u32 {
        self.max_delivery_count
    }

    /// Decide the outcome of a failed delivery for a message currently at
    /// `delivery_count`.
    ///
    /// The count is incremented; the message dead-letters when the new count
    /// is strictly above `max_delivery_count`.
    pub fn on_delivery_failure(&self, delivery_count: u32) -> DeliveryDisposition {
        let next = delivery_count.saturating_add(1);
        if next > self.max_delivery_count {
            DeliveryDisposition::DeadLetter {
                delivery_count: next,
            }
        } else {
            DeliveryDisposition::Redeliver {
                delivery_count: next,
            }
        }
    }
}

/// Why a message ended up in the dead-letter sub-queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    MaxDeliveryCountExceeded,
    TtlExpired,
    /// Application supplied reason from an explicit dead-letter call
    Explicit(String),
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::MaxDeliveryCountExceeded => "MaxDeliveryCountExceeded",
            Self::TtlExpired => "TTLExpiredException",
            Self::Explicit(reason) => reason,
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

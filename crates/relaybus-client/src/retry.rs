//! Exponential backoff for transient transmission failures.
//!
//! The client only retries the transmission of a single settlement call.
//! The policy is public so callers can drive business-level retries (resend,
//! re-receive, re-accept a session) with the same backoff.

use crate::config::duration_millis;
use crate::error::{ClientError, ConfigurationError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Backoff schedule for retrying transient failures
///
/// ```rust
/// use relaybus_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(5, Duration::from_millis(200))
///     .with_max_delay(Duration::from_secs(10))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random spread applied to each delay as a fraction of it; 0 disables
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Spread each delay by up to `fraction` of itself in either direction
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// `base_delay * multiplier^retry`, capped at `max_delay`, then jittered.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let uncapped = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // NaN or negative factors collapse to an immediate retry
        if uncapped.is_nan() || uncapped <= 0.0 {
            return Duration::ZERO;
        }
        let nominal = uncapped.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter <= 0.0 {
            return Duration::try_from_secs_f64(nominal).unwrap_or(self.max_delay);
        }

        let spread = nominal * jitter;
        let jittered = nominal + rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Reject schedules that cannot produce a sensible delay.
    ///
    /// Fields are public and loaded from settings, so the builders alone do
    /// not guarantee these bounds.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: String| Err(ConfigurationError::Invalid { message });

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return invalid(format!(
                "retry.multiplier must be a finite value of at least 1.0, got {}",
                self.multiplier
            ));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return invalid(format!(
                "retry.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            ));
        }
        if self.max_delay < self.base_delay {
            return invalid(format!(
                "retry.max_delay ({:?}) is shorter than retry.base_delay ({:?})",
                self.max_delay, self.base_delay
            ));
        }

        Ok(())
    }

    /// Attempts made before giving up, first try included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `operation`, retrying `Transient` failures on this schedule.
    ///
    /// Any other error is returned at once; after the last retry the final
    /// transient error is returned.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut retry = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }
            if retry >= self.max_retries {
                warn!(
                    operation = operation_name,
                    attempts = retry + 1,
                    error = %error,
                    "Giving up after transient failures"
                );
                return Err(error);
            }

            let delay = self.delay_for(retry);
            debug!(
                operation = operation_name,
                retry = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

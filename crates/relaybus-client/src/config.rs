//! Connection, entity and receiver configuration.
//!
//! The core only consumes resolved values. [`ClientSettings::load`] is a
//! convenience for applications that keep those values in files or the
//! environment.

use crate::dead_letter::DEFAULT_MAX_DELIVERY_COUNT;
use crate::entity::EntityPath;
use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Default largest single message accepted by a sender (256 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Default largest batch accepted by a sender (1 MiB).
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1024 * 1024;

/// Environment prefix used by [`ClientSettings::load`].
pub const ENV_PREFIX: &str = "RELAYBUS";

// ============================================================================
// Credentials
// ============================================================================

/// Credential presented when opening a connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    SharedAccessKey { key_name: String, key: String },
    Anonymous,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedAccessKey { key_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("key_name", key_name)
                .field("key", &"<redacted>")
                .finish(),
            Self::Anonymous => write!(f, "Anonymous"),
        }
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

/// Configuration for a logical connection to a broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub credential: Credential,
    /// Deadline for a single send or settlement round trip
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
    /// Backoff for the transmission retry of settlement calls
    pub retry: RetryPolicy,
    pub max_message_size: usize,
    pub max_batch_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "sb://localhost/".to_string(),
            credential: Credential::Anonymous,
            operation_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Parse a `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...`
    /// connection string. Any `EntityPath` segment is returned alongside.
    pub fn from_connection_string(
        connection_string: &str,
    ) -> Result<(Self, Option<EntityPath>), ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity = None;

        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
                message: format!("connection string segment '{}' is not key=value", part),
            })?;

            match name.trim() {
                "Endpoint" => endpoint = Some(value.trim().to_string()),
                "SharedAccessKeyName" => key_name = Some(value.trim().to_string()),
                "SharedAccessKey" => key = Some(value.trim().to_string()),
                "EntityPath" => {
                    let path = value
                        .trim()
                        .parse::<EntityPath>()
                        .map_err(|e| ConfigurationError::Parsing {
                            message: format!("invalid EntityPath: {}", e),
                        })?;
                    entity = Some(path);
                }
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;

        let credential = match (key_name, key) {
            (Some(key_name), Some(key)) => Credential::SharedAccessKey { key_name, key },
            (None, None) => Credential::Anonymous,
            (Some(_), None) => {
                return Err(ConfigurationError::Missing {
                    key: "SharedAccessKey".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigurationError::Missing {
                    key: "SharedAccessKeyName".to_string(),
                })
            }
        };

        let config = Self {
            endpoint,
            credential,
            ..Default::default()
        };
        config.validate()?;

        Ok((config, entity))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ConfigurationError::Invalid {
            message: format!("endpoint '{}' is not a valid URL: {}", self.endpoint, e),
        })?;

        if url.host_str().is_none() {
            return Err(ConfigurationError::Invalid {
                message: format!("endpoint '{}' has no host", self.endpoint),
            });
        }

        if self.operation_timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "operation_timeout must be greater than zero".to_string(),
            });
        }

        if self.max_message_size == 0 || self.max_batch_size < self.max_message_size {
            return Err(ConfigurationError::Invalid {
                message: "max_batch_size must be at least max_message_size, which must be non-zero"
                    .to_string(),
            });
        }

        self.retry.validate()
    }
}

// ============================================================================
// Entity Properties
// ============================================================================

/// Entity-level settings reported by the broker.
///
/// Provisioning is owned by the broker; clients read these values to apply
/// lock durations and the dead-letter threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityProperties {
    pub max_delivery_count: u32,
    #[serde(with = "duration_millis")]
    pub lock_duration: Duration,
    pub requires_session: bool,
    /// Enables duplicate detection over this window when set
    #[serde(with = "optional_duration_millis")]
    pub duplicate_detection_window: Option<Duration>,
    #[serde(with = "optional_duration_millis")]
    pub default_message_ttl: Option<Duration>,
    pub dead_lettering_on_message_expiration: bool,
}

impl Default for EntityProperties {
    fn default() -> Self {
        Self {
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            lock_duration: Duration::from_secs(60),
            requires_session: false,
            duplicate_detection_window: None,
            default_message_ttl: None,
            dead_lettering_on_message_expiration: false,
        }
    }
}

impl EntityProperties {
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_sessions(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn with_duplicate_detection(mut self, window: Duration) -> Self {
        self.duplicate_detection_window = Some(window);
        self
    }

    pub fn with_default_message_ttl(mut self, ttl: Duration) -> Self {
        self.default_message_ttl = Some(ttl);
        self
    }

    pub fn with_dead_lettering_on_message_expiration(mut self) -> Self {
        self.dead_lettering_on_message_expiration = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_delivery_count == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_delivery_count must be at least 1".to_string(),
            });
        }

        if self.lock_duration.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "lock_duration must be greater than zero".to_string(),
            });
        }

        if matches!(self.duplicate_detection_window, Some(w) if w.is_zero()) {
            return Err(ConfigurationError::Invalid {
                message: "duplicate_detection_window must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Receiver Options
// ============================================================================

/// Options applied when creating receivers and session routers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    /// Messages fetched per round trip beyond what a call asks for; 0 disables prefetch
    pub prefetch_count: u32,
    /// Default wait used by [`crate::Receiver::receive_message`]
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
    /// Optional name recorded as the lease owner
    pub identifier: Option<String>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            max_wait: Duration::from_secs(60),
            identifier: None,
        }
    }
}

impl ReceiverOptions {
    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

// ============================================================================
// Settings Loader
// ============================================================================

/// Resolved settings for an application using a single entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Optional connection string; overrides endpoint and credential when set
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Entity to use; may come from the connection string's `EntityPath` instead
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub receiver: ReceiverOptions,
}

impl ClientSettings {
    /// Load settings from files and the environment.
    ///
    /// Sources, later ones override earlier ones:
    ///  1. `config/relaybus.{toml,yaml,json}` if present
    ///  2. `explicit_path` if given (must exist)
    ///  3. environment variables prefixed `RELAYBUS__`, e.g.
    ///     `RELAYBUS__RECEIVER__PREFETCH_COUNT=50`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/relaybus").required(false));

        if let Some(path) = explicit_path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.resolve()
    }

    /// Apply the connection string, if any, and validate.
    fn resolve(mut self) -> Result<Self, ConfigurationError> {
        if let Some(connection_string) = self.connection_string.as_deref() {
            let (parsed, entity) = ConnectionConfig::from_connection_string(connection_string)?;
            self.connection.endpoint = parsed.endpoint;
            self.connection.credential = parsed.credential;
            if let Some(entity) = entity {
                self.entity = entity.to_string();
            }
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.connection.validate()?;
        if self.entity.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "entity".to_string(),
            });
        }
        self.entity_path()?;
        Ok(())
    }

    /// Parsed entity path
    pub fn entity_path(&self) -> Result<EntityPath, ConfigurationError> {
        self.entity
            .parse()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("entity '{}': {}", self.entity, e),
            })
    }
}

/// Serialize durations as integer milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

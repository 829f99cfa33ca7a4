use std::env;
use std::fmt;
use std::time::Duration;

use crate::consumer_retry::RetryConfig;
use crate::routing::DEFAULT_PARTITIONS;

/// Which broker implementation backs the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    InMemory,
    Kafka,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// SASL credentials for the broker connection
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Event bus configuration parsed from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub broker: BrokerKind,
    /// Comma-separated bootstrap list
    pub kafka_brokers: String,
    pub client_id: String,
    pub ssl: bool,
    pub sasl: Option<SaslCredentials>,
    /// Producer payload compression codec
    pub compression: String,
    pub partitions: u32,
    /// Upper bound on a single send, including the client's own retries
    pub send_timeout: Duration,
    /// Startup connection policy for producer and consumers
    pub connect_retry: RetryConfig,
    /// In-place handler retry before dead-lettering
    pub handler_retry: RetryConfig,
    /// Publishing service name, stamped as `source` on every envelope
    pub service_name: String,
    pub service_version: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::InMemory,
            kafka_brokers: "localhost:9092".to_string(),
            client_id: "clinical-event-bus".to_string(),
            ssl: false,
            sasl: None,
            compression: "gzip".to_string(),
            partitions: DEFAULT_PARTITIONS,
            send_timeout: Duration::from_secs(30),
            connect_retry: RetryConfig::default(),
            handler_retry: RetryConfig::single_attempt(),
            service_name: "clinical-event-bus".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BusConfig {
    /// Load from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let broker = match var("BROKER_TYPE")
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "inmemory" | "memory" => BrokerKind::InMemory,
            "kafka" => BrokerKind::Kafka,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "BROKER_TYPE",
                    value: other.to_string(),
                    reason: "must be 'inmemory' or 'kafka'".to_string(),
                })
            }
        };

        let service_name = var("SERVICE_NAME").unwrap_or(defaults.service_name);

        let sasl = match (
            var("KAFKA_SASL_USERNAME"),
            var("KAFKA_SASL_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(SaslCredentials {
                mechanism: var("KAFKA_SASL_MECHANISM").unwrap_or_else(|| "PLAIN".to_string()),
                username,
                password,
            }),
            (Some(_), None) => return Err(ConfigError::Missing("KAFKA_SASL_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("KAFKA_SASL_USERNAME")),
            (None, None) => None,
        };

        let partitions: u32 = parse(&var, "BUS_PARTITIONS", defaults.partitions)?;
        if partitions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BUS_PARTITIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let connect_retry = RetryConfig {
            max_attempts: parse(&var, "BUS_CONNECT_MAX_ATTEMPTS", defaults.connect_retry.max_attempts)?,
            initial_backoff: Duration::from_millis(parse(&var, "BUS_RETRY_INITIAL_MS", 100)?),
            max_backoff: Duration::from_millis(parse(&var, "BUS_RETRY_MAX_MS", 30_000)?),
            multiplier: 2,
        };

        let handler_retry = RetryConfig {
            max_attempts: parse(&var, "HANDLER_MAX_ATTEMPTS", 1)?,
            ..connect_retry.clone()
        };

        Ok(Self {
            broker,
            kafka_brokers: var("KAFKA_BROKERS").unwrap_or(defaults.kafka_brokers),
            client_id: var("KAFKA_CLIENT_ID").unwrap_or_else(|| service_name.clone()),
            ssl: parse(&var, "KAFKA_SSL", false)?,
            sasl,
            compression: var("KAFKA_COMPRESSION").unwrap_or(defaults.compression),
            partitions,
            send_timeout: Duration::from_millis(parse(&var, "BUS_SEND_TIMEOUT_MS", 30_000)?),
            connect_retry,
            handler_retry,
            service_name,
            service_version: var("SERVICE_VERSION").unwrap_or(defaults.service_version),
        })
    }
}

fn parse<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

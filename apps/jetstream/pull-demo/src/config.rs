//! Configuration for the pull consumer demo

use core_config::{ConfigError, FromEnv, NatsConfig, env_optional, env_or_default, env_parse_or};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which broker the scenarios run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Nats,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Backend::Memory),
            "nats" => Ok(Backend::Nats),
            other => Err(format!("unknown backend '{}', expected memory or nats", other)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Memory => write!(f, "memory"),
            Backend::Nats => write!(f, "nats"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub backend: Backend,
    /// Stream name; each scenario appends its own suffix.
    pub stream: String,
    /// Subject prefix; messages go to `<subject>.<n>`.
    pub subject: String,
    pub messages: usize,
    pub batch_size: usize,
    pub payload_bytes: usize,
    /// Byte cap for the large-batch scenario.
    pub max_bytes: usize,
    pub fetch_timeout: Duration,
    /// Only loaded for the NATS backend.
    pub nats: Option<NatsConfig>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            stream: "EVENTS".to_string(),
            subject: "event".to_string(),
            messages: 5,
            batch_size: 2,
            payload_bytes: 50,
            max_bytes: 300,
            fetch_timeout: Duration::from_millis(500),
            nats: None,
        }
    }
}

/// Parse `key` like [`env_parse_or`], rejecting zero.
fn env_positive<T>(key: &str, default: T, what: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let value = env_parse_or(key, default)?;
    if value == T::default() {
        return Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{} must be at least 1", what),
        });
    }
    Ok(value)
}

impl FromEnv for DemoConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let backend = env_parse_or("PULL_DEMO_BACKEND", defaults.backend)?;
        let batch_size = env_positive("PULL_DEMO_BATCH", defaults.batch_size, "batch size")?;
        let max_bytes = env_positive("PULL_DEMO_MAX_BYTES", defaults.max_bytes, "max bytes")?;
        let fetch_timeout_ms = env_positive("PULL_DEMO_FETCH_TIMEOUT_MS", 500u64, "fetch timeout")?;

        let nats = match backend {
            Backend::Nats => Some(NatsConfig::from_env()?),
            Backend::Memory => None,
        };

        Ok(Self {
            backend,
            stream: env_or_default("PULL_DEMO_STREAM", &defaults.stream),
            subject: env_optional("PULL_DEMO_SUBJECT").unwrap_or(defaults.subject),
            messages: env_parse_or("PULL_DEMO_MESSAGES", defaults.messages)?,
            batch_size,
            payload_bytes: env_parse_or("PULL_DEMO_PAYLOAD_BYTES", defaults.payload_bytes)?,
            max_bytes,
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            nats,
        })
    }
}

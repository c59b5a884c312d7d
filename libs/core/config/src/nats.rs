//! NATS connection settings.
//!
//! | Variable | Default |
//! |---|---|
//! | `NATS_URL` | `nats://localhost:4222` |
//! | `NATS_CLIENT_NAME` | `pull-consumer` |
//! | `NATS_CONNECT_TIMEOUT_SECS` | `5` |
//! | `NATS_CREDS` | unset |
//! | `NATS_TOKEN` | unset |
//! | `NATS_USER` / `NATS_PASSWORD` | unset |
//!
//! When several credential kinds are set the creds file wins, then the
//! token, then user and password.

use crate::{env_optional, env_or_default, env_parse_or, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// How the client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum NatsCredentials {
    None,
    UserPassword { user: String, password: String },
    Token(String),
    CredsFile(String),
}

impl std::fmt::Debug for NatsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::CredsFile(path) => f.debug_tuple("CredsFile").field(path).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NatsConfig {
    pub url: String,
    pub client_name: String,
    pub connect_timeout: Duration,
    pub credentials: NatsCredentials,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: "pull-consumer".to_string(),
            connect_timeout: Duration::from_secs(5),
            credentials: NatsCredentials::None,
        }
    }
}

impl FromEnv for NatsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let credentials = if let Some(path) = env_optional("NATS_CREDS") {
            NatsCredentials::CredsFile(path)
        } else if let Some(token) = env_optional("NATS_TOKEN") {
            NatsCredentials::Token(token)
        } else if let Some(user) = env_optional("NATS_USER") {
            NatsCredentials::UserPassword {
                user,
                password: env_required("NATS_PASSWORD")?,
            }
        } else {
            NatsCredentials::None
        };

        Ok(Self {
            url: env_or_default("NATS_URL", "nats://localhost:4222"),
            client_name: env_or_default("NATS_CLIENT_NAME", "pull-consumer"),
            connect_timeout: Duration::from_secs(env_parse_or("NATS_CONNECT_TIMEOUT_SECS", 5u64)?),
            credentials,
        })
    }
}

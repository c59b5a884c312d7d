//! Application callback used by [`ConsumerSession::consume`](crate::ConsumerSession::consume).

use crate::error::{ErrorCategory, PullError};
use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Error returned by a [`MessageHandler`].
///
/// The category decides what happens to the message:
/// - `Transient`: nacked with exponential backoff until retries run out
/// - `Permanent`: terminated, never redelivered
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Temporary failure (downstream timeout, resource busy)
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failure that a redelivery will not fix (invalid payload)
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::Transient { .. } => ErrorCategory::Transient,
            HandlerError::Permanent { .. } => ErrorCategory::Permanent,
            HandlerError::Serialization(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if the message should be redelivered after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        self.category().should_retry(retry_count)
    }

    /// Delay before the next delivery.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        self.category().backoff_delay_ms(retry_count)
    }
}

impl From<PullError> for HandlerError {
    fn from(error: PullError) -> Self {
        let message = error.to_string();
        match error.category() {
            ErrorCategory::Transient => HandlerError::Transient {
                message,
                source: Some(Box::new(error)),
            },
            ErrorCategory::Permanent => HandlerError::Permanent {
                message,
                source: Some(Box::new(error)),
            },
        }
    }
}

/// Message handler.
///
/// Implement this to process messages pulled by a session. The session acks
/// on `Ok(())` and nacks or terminates on error depending on its category.
///
/// # Example
///
/// ```rust,ignore
/// use pull_consumer::{HandlerError, Message, MessageHandler};
/// use async_trait::async_trait;
///
/// struct OrderHandler;
///
/// #[async_trait]
/// impl MessageHandler for OrderHandler {
///     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
///         let order: Order = message.json()?;
///         store(order).await.map_err(|e| HandlerError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "order_handler"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;

    /// Handler name, used in logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_pull_error() {
        let transient: HandlerError = PullError::Connection("reset".to_string()).into();
        assert_eq!(transient.category(), ErrorCategory::Transient);

        let permanent: HandlerError = PullError::protocol("bad").into();
        assert_eq!(permanent.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_retry_budget() {
        let error = HandlerError::transient("busy");
        assert!(error.should_retry(0));
        assert!(error.should_retry(2));
        assert!(!error.should_retry(3));
        assert_eq!(error.backoff_delay_ms(1), 1000);

        assert!(!HandlerError::permanent("nope").should_retry(0));
    }
}

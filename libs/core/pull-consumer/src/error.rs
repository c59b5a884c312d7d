//! Error types for the pull consumer.

use crate::fetch::FetchStatus;
use std::fmt;
use thiserror::Error;

/// Error categories determine how a caller should react to a failure.
///
/// The consumer core never retries on its own. Callers layer a retry
/// policy on top using [`ErrorCategory::should_retry`] and
/// [`ErrorCategory::backoff_delay_ms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (broker unreachable, ack not confirmed).
    /// Retry 3x with 500ms-10s exponential backoff.
    Transient,

    /// Failure that will not go away by repeating the call
    /// (invalid request, consumer deleted, session closed).
    Permanent,
}

impl ErrorCategory {
    /// Get the maximum retry count for this error category.
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorCategory::Transient => 3,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Get the base backoff delay in milliseconds.
    pub fn base_backoff_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 500,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Get the maximum backoff delay in milliseconds.
    pub fn max_backoff_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 10_000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Calculate backoff delay for a given retry count.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        if *self == ErrorCategory::Permanent {
            return 0;
        }

        let delay = self
            .base_backoff_ms()
            .saturating_mul(2u64.saturating_pow(retry_count));
        delay.min(self.max_backoff_ms())
    }

    /// Check if the operation should be retried given the current retry count.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error that can occur while talking to the broker or driving a session.
///
/// A fetch that times out with no messages is *not* an error; it is reported
/// as [`FetchStatus::Timeout`] on the batch.
#[derive(Debug, Error)]
pub enum PullError {
    /// The broker connection is unusable. Requires a reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed request or a request that breaks a consumer limit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An acknowledgment could not be delivered or is not allowed.
    /// The message stays pending locally.
    #[error("ack failed for sequence {sequence}: {reason}")]
    Ack { sequence: u64, reason: String },

    /// The consumer no longer exists on the broker (ephemeral expiry or
    /// deletion). The session has to be recreated.
    #[error("consumer '{consumer}' on stream '{stream}' is gone")]
    ConsumerGone { stream: String, consumer: String },

    /// Consumer lookup by name failed.
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Stream lookup by name failed.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Publishing a message failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Any other broker-reported failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session is draining or closed and no longer accepts the operation.
    #[error("session is {0}")]
    SessionClosed(&'static str),

    /// Payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A fetch loop stopped on a hard error.
    #[error("{operation} failed (last status: {}): {source}", .last_status.map_or("none".to_string(), |s| s.to_string()))]
    Halted {
        operation: &'static str,
        last_status: Option<FetchStatus>,
        #[source]
        source: Box<PullError>,
    },
}

/// Convenience alias used throughout the crate.
pub type PullResult<T> = Result<T, PullError>;

impl PullError {
    /// Get the error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PullError::Connection(_) => ErrorCategory::Transient,
            PullError::Ack { .. } => ErrorCategory::Transient,
            PullError::Publish(_) => ErrorCategory::Transient,
            PullError::Broker(msg) if msg.contains("timeout") => ErrorCategory::Transient,

            PullError::Protocol(_) => ErrorCategory::Permanent,
            PullError::ConsumerGone { .. } => ErrorCategory::Permanent,
            PullError::ConsumerNotFound(_) => ErrorCategory::Permanent,
            PullError::StreamNotFound(_) => ErrorCategory::Permanent,
            PullError::Config(_) => ErrorCategory::Permanent,
            PullError::SessionClosed(_) => ErrorCategory::Permanent,
            PullError::Serialization(_) => ErrorCategory::Permanent,
            PullError::Broker(_) => ErrorCategory::Permanent,

            PullError::Halted { source, .. } => source.category(),
        }
    }

    /// Check if this error should be retried.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        self.category().should_retry(retry_count)
    }

    /// Calculate backoff delay for retry.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        self.category().backoff_delay_ms(retry_count)
    }

    /// Whether the session has to be recreated to make progress.
    pub fn is_consumer_gone(&self) -> bool {
        match self {
            PullError::ConsumerGone { .. } => true,
            PullError::Halted { source, .. } => source.is_consumer_gone(),
            _ => false,
        }
    }

    /// Create a broker error from any displayable client error.
    pub fn from_broker_error(error: impl fmt::Display) -> Self {
        Self::Broker(error.to_string())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an ack error.
    pub fn ack(sequence: u64, reason: impl Into<String>) -> Self {
        Self::Ack {
            sequence,
            reason: reason.into(),
        }
    }

    /// Create a consumer-gone error.
    pub fn consumer_gone(stream: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self::ConsumerGone {
            stream: stream.into(),
            consumer: consumer.into(),
        }
    }

    /// Wrap a loop-terminating error with the operation and the last status.
    pub fn halted(
        operation: &'static str,
        last_status: Option<FetchStatus>,
        source: PullError,
    ) -> Self {
        Self::Halted {
            operation,
            last_status,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_backoff() {
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(0), 500);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1), 1000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(10), 10_000); // Capped
        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(3), 0);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            PullError::Connection("reset".to_string()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(PullError::ack(4, "no reply").category(), ErrorCategory::Transient);
        assert_eq!(
            PullError::protocol("max_count must be >= 1").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            PullError::consumer_gone("EVENTS", "eph").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            PullError::Broker("request timeout".to_string()).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_should_retry() {
        let transient = PullError::ack(1, "timed out");
        assert!(transient.should_retry(0));
        assert!(transient.should_retry(2));
        assert!(!transient.should_retry(3));

        let permanent = PullError::Config("invalid".to_string());
        assert!(!permanent.should_retry(0));
    }

    #[test]
    fn test_halted_reports_operation_and_status() {
        let err = PullError::halted(
            "fetch",
            Some(FetchStatus::Ok),
            PullError::consumer_gone("EVENTS", "eph-1"),
        );

        let text = err.to_string();
        assert!(text.contains("fetch failed"));
        assert!(text.contains("last status: ok"));
        assert!(text.contains("eph-1"));
        assert!(err.is_consumer_gone());
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }
}

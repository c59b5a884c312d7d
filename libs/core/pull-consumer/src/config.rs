//! Stream, consumer and fetch-loop configuration.

use crate::error::{PullError, PullResult};
use crate::fetch::BatchRequest;
use std::time::Duration;

/// Inactivity threshold after which the broker reclaims an ephemeral consumer.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5);

/// Time the broker waits for an ack before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

const INVALID_NAME_CHARS: &[char] = &['.', '*', '>', ' '];

/// Stream definition trait (type-safe constants).
///
/// # Example
///
/// ```rust
/// use pull_consumer::{ConsumerConfig, StreamConfig, StreamDef};
///
/// struct Events;
///
/// impl StreamDef for Events {
///     const STREAM_NAME: &'static str = "EVENTS";
///     const SUBJECT: &'static str = "event.>";
///     const CONSUMER_NAME: &'static str = "event-consumer";
/// }
///
/// let stream = StreamConfig::from_def::<Events>();
/// let consumer = ConsumerConfig::from_def::<Events>();
/// assert_eq!(stream.subjects, vec!["event.>".to_string()]);
/// assert_eq!(consumer.durable_name.as_deref(), Some("event-consumer"));
/// ```
pub trait StreamDef {
    /// Stream name (e.g., "EVENTS")
    const STREAM_NAME: &'static str;

    /// Subject pattern (e.g., "event.>")
    const SUBJECT: &'static str;

    /// Durable consumer name (e.g., "event-consumer")
    const CONSUMER_NAME: &'static str;

    /// Retention policy (default: limits)
    const RETENTION: RetentionPolicy = RetentionPolicy::Limits;

    /// Ack wait timeout in seconds (default: 30)
    const ACK_WAIT_SECS: u64 = 30;
}

/// How long the broker keeps messages in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Keep messages until a size/count limit evicts them.
    #[default]
    Limits,
    /// Keep messages until every consumer interested in them has acked.
    Interest,
    /// Remove a message as soon as one consumer acks it.
    WorkQueue,
}

/// Stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    /// Oldest messages are evicted past this count (limits retention only).
    pub max_messages: Option<u64>,
}

impl StreamConfig {
    /// Create a limits-based stream listening on `subjects`.
    pub fn new<S: Into<String>>(name: impl Into<String>, subjects: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            retention: RetentionPolicy::Limits,
            max_messages: None,
        }
    }

    /// Create from a StreamDef trait.
    pub fn from_def<S: StreamDef>() -> Self {
        Self {
            retention: S::RETENTION,
            ..Self::new(S::STREAM_NAME, [S::SUBJECT])
        }
    }

    /// Set the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Cap the number of stored messages.
    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn validate(&self) -> PullResult<()> {
        if self.name.is_empty() || self.name.contains(INVALID_NAME_CHARS) {
            return Err(PullError::Config(format!(
                "invalid stream name '{}'",
                self.name
            )));
        }
        if self.subjects.is_empty() {
            return Err(PullError::Config(format!(
                "stream '{}' needs at least one subject",
                self.name
            )));
        }
        Ok(())
    }
}

/// Pull consumer configuration.
///
/// A consumer with a `durable_name` survives until it is deleted. Without one
/// it is ephemeral and the broker removes it after `inactive_threshold` with
/// no fetch activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable name; `None` creates an ephemeral consumer.
    pub durable_name: Option<String>,
    /// Only deliver messages whose subject matches this filter.
    pub filter_subject: Option<String>,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Maximum deliveries per message; `None` means unlimited.
    pub max_deliver: Option<u32>,
    /// Maximum un-acked messages across all sessions bound to the consumer.
    pub max_ack_pending: Option<usize>,
    /// Maximum fetch requests waiting in parallel.
    pub max_waiting: Option<usize>,
    /// Largest `max_count` a single request may ask for.
    pub max_request_batch: Option<usize>,
    /// Longest expiry a single request may ask for.
    pub max_request_expires: Option<Duration>,
    /// Largest `max_bytes` a single request may ask for.
    pub max_request_max_bytes: Option<usize>,
    /// Idle time after which an ephemeral consumer is removed.
    pub inactive_threshold: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            filter_subject: None,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
            max_ack_pending: None,
            max_waiting: None,
            max_request_batch: None,
            max_request_expires: None,
            max_request_max_bytes: None,
            inactive_threshold: DEFAULT_INACTIVE_THRESHOLD,
        }
    }
}

impl ConsumerConfig {
    /// An ephemeral consumer.
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// A durable consumer with the given name.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Create from a StreamDef trait.
    pub fn from_def<S: StreamDef>() -> Self {
        Self {
            filter_subject: Some(S::SUBJECT.to_string()),
            ack_wait: Duration::from_secs(S::ACK_WAIT_SECS),
            ..Self::durable(S::CONSUMER_NAME)
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }

    /// Set the filter subject.
    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    /// Set the ack wait.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set the maximum number of deliveries.
    pub fn with_max_deliver(mut self, max: u32) -> Self {
        self.max_deliver = Some(max);
        self
    }

    /// Set the in-flight limit.
    pub fn with_max_ack_pending(mut self, max: usize) -> Self {
        self.max_ack_pending = Some(max);
        self
    }

    /// Set the waiting request limit.
    pub fn with_max_waiting(mut self, max: usize) -> Self {
        self.max_waiting = Some(max);
        self
    }

    /// Set the per-request batch limit.
    pub fn with_max_request_batch(mut self, max: usize) -> Self {
        self.max_request_batch = Some(max);
        self
    }

    /// Set the per-request expiry limit.
    pub fn with_max_request_expires(mut self, max: Duration) -> Self {
        self.max_request_expires = Some(max);
        self
    }

    /// Set the per-request byte limit.
    pub fn with_max_request_max_bytes(mut self, max: usize) -> Self {
        self.max_request_max_bytes = Some(max);
        self
    }

    /// Set the inactivity threshold for ephemeral consumers.
    pub fn with_inactive_threshold(mut self, threshold: Duration) -> Self {
        self.inactive_threshold = threshold;
        self
    }

    pub fn validate(&self) -> PullResult<()> {
        if let Some(name) = &self.durable_name {
            if name.is_empty() || name.contains(INVALID_NAME_CHARS) {
                return Err(PullError::Config(format!("invalid consumer name '{}'", name)));
            }
        }
        if self.ack_wait.is_zero() {
            return Err(PullError::Config("ack_wait must be positive".to_string()));
        }
        if self.max_deliver == Some(0) {
            return Err(PullError::Config("max_deliver must be at least 1".to_string()));
        }
        if self.max_ack_pending == Some(0) {
            return Err(PullError::Config(
                "max_ack_pending must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for a session fetch loop.
///
/// The loop stops once `total` messages have been received, or after
/// `empty_polls` consecutive fetches came back empty with a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    /// Template for each fetch.
    pub request: BatchRequest,
    /// Stop after this many messages; `None` runs until the queue is drained.
    pub total: Option<usize>,
    /// Consecutive empty timeouts that mean "drained".
    pub empty_polls: u32,
}

impl FetchPlan {
    /// Fetch `batch_size` at a time until `total` messages arrived.
    pub fn new(batch_size: usize, total: usize) -> Self {
        Self {
            request: BatchRequest::new(batch_size),
            total: Some(total),
            empty_polls: 1,
        }
    }

    /// Fetch with `request` until the queue is drained.
    pub fn until_drained(request: BatchRequest) -> Self {
        Self {
            request,
            total: None,
            empty_polls: 1,
        }
    }

    /// Set the fetch timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = timeout;
        self
    }

    /// Set the byte ceiling for each fetch.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.request.max_bytes = Some(max_bytes);
        self
    }

    /// Require several empty timeouts in a row before stopping.
    pub fn with_empty_polls(mut self, polls: u32) -> Self {
        self.empty_polls = polls.max(1);
        self
    }

    /// Request for the next fetch given how many messages already arrived.
    pub fn next_request(&self, received: usize) -> BatchRequest {
        let mut request = self.request.clone();
        if let Some(total) = self.total {
            request.max_count = request.max_count.min(total.saturating_sub(received)).max(1);
        }
        request
    }

    /// Whether the loop has everything it asked for.
    pub fn is_satisfied(&self, received: usize) -> bool {
        self.total.is_some_and(|total| received >= total)
    }
}

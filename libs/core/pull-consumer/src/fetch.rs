//! Batch fetch request/response types.
//!
//! A fetch asks the broker for at most `max_count` messages whose payloads add
//! up to at most `max_bytes`, waiting up to `timeout` for the first one. With
//! `no_wait` set the broker answers immediately with whatever it has.

use crate::error::{PullError, PullResult};
use crate::message::Message;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Default expiry for a fetch request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// About 30 years. Longer waits are treated as this long.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + wait`, clamped so a huge timeout or ack wait cannot overflow.
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start + wait.min(FAR_FUTURE)
}

/// Terminal status of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// At least one message was returned.
    Ok,
    /// The request expired (or `no_wait` found nothing). Not an error.
    Timeout,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStatus::Ok => write!(f, "ok"),
            FetchStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Parameters of a single pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Maximum number of messages to return (>= 1).
    pub max_count: usize,
    /// Optional ceiling on the summed payload size.
    pub max_bytes: Option<usize>,
    /// How long to wait for the first message.
    pub timeout: Duration,
    /// Return immediately with whatever is available.
    pub no_wait: bool,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            max_count: 1,
            max_bytes: None,
            timeout: DEFAULT_FETCH_TIMEOUT,
            no_wait: false,
        }
    }
}

impl BatchRequest {
    /// Request up to `max_count` messages with the default timeout.
    pub fn new(max_count: usize) -> Self {
        Self {
            max_count,
            ..Default::default()
        }
    }

    /// Request up to `max_count` messages without waiting.
    pub fn no_wait(max_count: usize) -> Self {
        Self {
            max_count,
            no_wait: true,
            ..Default::default()
        }
    }

    /// Set the byte ceiling.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Set the expiry.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the request before it leaves the client.
    pub fn validate(&self) -> PullResult<()> {
        if self.max_count == 0 {
            return Err(PullError::protocol("max_count must be at least 1"));
        }
        if self.max_bytes == Some(0) {
            return Err(PullError::protocol("max_bytes must be at least 1 when set"));
        }
        if !self.no_wait && self.timeout.is_zero() {
            return Err(PullError::protocol(
                "timeout must be positive unless no_wait is set",
            ));
        }
        Ok(())
    }
}

/// Messages returned by one fetch, in stream order, plus the terminal status.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub messages: Vec<Message>,
    pub status: FetchStatus,
}

impl BatchResult {
    /// A batch carrying messages.
    pub fn ok(messages: Vec<Message>) -> Self {
        let status = if messages.is_empty() {
            FetchStatus::Timeout
        } else {
            FetchStatus::Ok
        };
        Self { messages, status }
    }

    /// An empty, expired batch.
    pub fn timeout() -> Self {
        Self {
            messages: Vec::new(),
            status: FetchStatus::Timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Empty and expired: the queue is drained for now.
    pub fn is_drained(&self) -> bool {
        self.is_empty() && self.status == FetchStatus::Timeout
    }

    /// Sum of payload sizes.
    pub fn total_bytes(&self) -> usize {
        self.messages.iter().map(Message::size).sum()
    }
}

impl IntoIterator for BatchResult {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// Tracks how much of a request has been filled.
///
/// Brokers push candidates through [`BatchBudget::admit`] in delivery order
/// and stop at the first refusal, so a batch never exceeds either limit.
#[derive(Debug, Clone)]
pub struct BatchBudget {
    remaining_count: usize,
    remaining_bytes: Option<usize>,
    admitted: usize,
}

/// Outcome of offering one message to a [`BatchBudget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The message fits.
    Admitted,
    /// The batch is full (count or bytes); stop here.
    Full,
    /// The message alone is larger than the byte ceiling.
    TooLarge,
}

impl BatchBudget {
    pub fn new(request: &BatchRequest) -> Self {
        Self {
            remaining_count: request.max_count,
            remaining_bytes: request.max_bytes,
            admitted: 0,
        }
    }

    /// Offer a message of `size` payload bytes.
    pub fn admit(&mut self, size: usize) -> Admission {
        if self.remaining_count == 0 {
            return Admission::Full;
        }
        if let Some(remaining) = self.remaining_bytes {
            if size > remaining {
                return if self.admitted == 0 {
                    Admission::TooLarge
                } else {
                    Admission::Full
                };
            }
            self.remaining_bytes = Some(remaining - size);
        }
        self.remaining_count -= 1;
        self.admitted += 1;
        Admission::Admitted
    }

    pub fn is_full(&self) -> bool {
        self.remaining_count == 0 || self.remaining_bytes == Some(0)
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_clamps_huge_waits() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(2)), now + Duration::from_secs(2));
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        assert!(BatchRequest::new(0).validate().is_err());
        assert!(BatchRequest::new(5).with_max_bytes(0).validate().is_err());
        assert!(BatchRequest::new(5)
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());

        // no_wait does not need a timeout
        let mut request = BatchRequest::no_wait(5);
        request.timeout = Duration::ZERO;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_budget_stops_on_count() {
        let mut budget = BatchBudget::new(&BatchRequest::new(2));
        assert_eq!(budget.admit(10), Admission::Admitted);
        assert_eq!(budget.admit(10), Admission::Admitted);
        assert_eq!(budget.admit(10), Admission::Full);
        assert_eq!(budget.admitted(), 2);
        assert!(budget.is_full());
    }

    #[test]
    fn test_budget_stops_before_exceeding_bytes() {
        let mut budget = BatchBudget::new(&BatchRequest::new(1000).with_max_bytes(300));
        let admitted = (0..10)
            .take_while(|_| budget.admit(50) == Admission::Admitted)
            .count();
        assert_eq!(admitted, 6);

        let mut budget = BatchBudget::new(&BatchRequest::new(1000).with_max_bytes(120));
        assert_eq!(budget.admit(50), Admission::Admitted);
        assert_eq!(budget.admit(50), Admission::Admitted);
        assert_eq!(budget.admit(50), Admission::Full);
    }

    #[test]
    fn test_budget_flags_oversized_first_message() {
        let mut budget = BatchBudget::new(&BatchRequest::new(10).with_max_bytes(4));
        assert_eq!(budget.admit(5), Admission::TooLarge);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FetchStatus::Ok.to_string(), "ok");
        assert_eq!(FetchStatus::Timeout.to_string(), "timeout");
    }
}

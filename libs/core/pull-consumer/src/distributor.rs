//! Several sessions sharing one durable consumer.
//!
//! The broker guarantees that a message is handed to only one of the bound
//! sessions at a time. The group only decides who asks next.

use crate::broker::Broker;
use crate::config::{ConsumerConfig, FetchPlan};
use crate::error::{PullError, PullResult};
use crate::fetch::BatchRequest;
use crate::handler::MessageHandler;
use crate::session::{ConsumeReport, ConsumerSession, DrainReport};
use futures::future::{join_all, try_join_all};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Poll timeout used by the round-robin convention.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Which sequences each session received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Indexed like [`BalancedGroup::sessions`].
    pub per_session: Vec<Vec<u64>>,
}

impl DistributionReport {
    pub fn total(&self) -> usize {
        self.per_session.iter().map(Vec::len).sum()
    }

    /// All received sequences, sorted.
    pub fn sequences(&self) -> Vec<u64> {
        let mut all: Vec<u64> = self.per_session.iter().flatten().copied().collect();
        all.sort_unstable();
        all
    }

    /// Whether any sequence reached more than one session.
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::new();
        self.per_session
            .iter()
            .flatten()
            .any(|sequence| !seen.insert(*sequence))
    }
}

/// N sessions bound to the same named consumer.
#[derive(Debug)]
pub struct BalancedGroup {
    sessions: Vec<ConsumerSession>,
}

impl BalancedGroup {
    /// Create (or reuse) the durable consumer described by `config` and bind
    /// `size` sessions to it.
    pub async fn open(
        broker: Arc<dyn Broker>,
        stream: &str,
        config: ConsumerConfig,
        size: usize,
    ) -> PullResult<Self> {
        let Some(name) = config.durable_name.clone() else {
            return Err(PullError::Config(
                "a balanced group needs a named consumer".to_string(),
            ));
        };
        if size == 0 {
            return Err(PullError::Config(
                "a balanced group needs at least one session".to_string(),
            ));
        }

        let first = ConsumerSession::open_with(broker.clone(), stream, config).await?;
        let mut sessions = Vec::with_capacity(size);
        sessions.push(first);
        for _ in 1..size {
            sessions.push(ConsumerSession::bind(broker.clone(), stream, &name).await?);
        }

        info!(stream = %stream, consumer = %name, size, "Balanced group bound");
        Ok(Self { sessions })
    }

    /// Bind `size` sessions to an existing consumer.
    pub async fn bind(
        broker: Arc<dyn Broker>,
        stream: &str,
        consumer_name: &str,
        size: usize,
    ) -> PullResult<Self> {
        let sessions = try_join_all(
            (0..size).map(|_| ConsumerSession::bind(broker.clone(), stream, consumer_name)),
        )
        .await?;
        Ok(Self { sessions })
    }

    pub fn sessions(&self) -> &[ConsumerSession] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask each session in turn for one batch of `request` and ack what
    /// arrives. Ends at the first empty timeout.
    pub async fn round_robin(&self, request: BatchRequest) -> PullResult<DistributionReport> {
        let mut report = DistributionReport {
            per_session: vec![Vec::new(); self.sessions.len()],
        };

        for (index, session) in self.sessions.iter().enumerate().cycle() {
            let batch = session
                .fetch(request.clone())
                .await
                .map_err(|e| PullError::halted("round-robin fetch", None, e))?;
            if batch.is_drained() {
                debug!(session = index, total = report.total(), "Round-robin finished");
                break;
            }
            for message in batch {
                session.ack(&message).await?;
                report.per_session[index].push(message.sequence);
            }
        }

        Ok(report)
    }

    /// Round-robin with one message per fetch and a short poll timeout.
    pub async fn round_robin_single(&self) -> PullResult<DistributionReport> {
        self.round_robin(BatchRequest::new(1).with_timeout(DEFAULT_POLL_TIMEOUT))
            .await
    }

    /// Run every session's consume loop concurrently.
    pub async fn consume_concurrently<H>(
        &self,
        plan: FetchPlan,
        handler: &H,
    ) -> PullResult<DistributionReport>
    where
        H: MessageHandler + ?Sized,
    {
        let reports: Vec<ConsumeReport> = try_join_all(
            self.sessions
                .iter()
                .map(|session| session.consume(plan.clone(), handler)),
        )
        .await?;

        Ok(DistributionReport {
            per_session: reports.into_iter().map(|report| report.sequences).collect(),
        })
    }

    /// Drain every session.
    pub async fn drain(&self) -> Vec<DrainReport> {
        join_all(self.sessions.iter().map(|session| session.drain())).await
    }

    pub fn close(&self) {
        for session in &self.sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_detects_duplicates() {
        let clean = DistributionReport {
            per_session: vec![vec![1, 3, 5], vec![2, 4]],
        };
        assert!(!clean.has_duplicates());
        assert_eq!(clean.total(), 5);
        assert_eq!(clean.sequences(), vec![1, 2, 3, 4, 5]);

        let dup = DistributionReport {
            per_session: vec![vec![1, 2], vec![2]],
        };
        assert!(dup.has_duplicates());
    }

    #[tokio::test]
    async fn test_group_requires_named_consumer() {
        let broker: Arc<dyn Broker> = Arc::new(crate::InMemoryBroker::new());
        let result = BalancedGroup::open(broker, "EVENTS", ConsumerConfig::ephemeral(), 2).await;
        assert!(matches!(result, Err(PullError::Config(_))));
    }
}

//! Consumer walkthroughs run by the demo binary.
//!
//! Each scenario creates its own stream, publishes what it needs, runs, and
//! deletes the stream again, so they can run back to back on one broker.

use crate::config::DemoConfig;
use crate::endpoints::{Endpoint, EndpointOutput};
use async_trait::async_trait;
use bytes::Bytes;
use eyre::{Result, WrapErr, eyre};
use futures::StreamExt;
use pull_consumer::{
    BalancedGroup, BatchRequest, Broker, ConsumerConfig, ConsumerSession, DistributionReport,
    FetchPlan, HandlerError, Message, MessageHandler, PullResult, StreamConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ack `message`, retrying transient failures with the category's backoff.
pub async fn ack_with_retry(session: &ConsumerSession, message: &Message) -> PullResult<()> {
    let mut attempt = 0;
    loop {
        match session.ack(message).await {
            Ok(()) => return Ok(()),
            Err(e) if e.should_retry(attempt) => {
                let delay = e.backoff_delay_ms(attempt);
                warn!(
                    sequence = message.sequence,
                    attempt,
                    delay_ms = delay,
                    error = %e,
                    "Ack failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Byte-capped fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLimitedFetch {
    pub requested: usize,
    pub received: usize,
    pub bytes: usize,
}

/// Outcome of the balanced pair walkthrough.
#[derive(Debug, Clone)]
pub struct BalancedOutcome {
    pub distribution: DistributionReport,
    /// Averages computed by the handler, one per message.
    pub averages: Vec<f64>,
}

/// Averages each message's JSON integer array.
#[derive(Default)]
struct AveragingHandler {
    handled: AtomicUsize,
    averages: Mutex<Vec<f64>>,
}

#[async_trait]
impl MessageHandler for AveragingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let input: Vec<i64> = message.json()?;
        let output = Endpoint::Average
            .apply(&input)
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        if let EndpointOutput::Average { value } = output {
            self.averages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
        }
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "averaging_handler"
    }
}

pub struct Scenarios {
    broker: Arc<dyn Broker>,
    config: DemoConfig,
}

impl Scenarios {
    pub fn new(broker: Arc<dyn Broker>, config: DemoConfig) -> Self {
        Self { broker, config }
    }

    fn stream_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.config.stream, suffix.to_uppercase())
    }

    fn subject_prefix(&self, suffix: &str) -> String {
        format!("{}.{}", self.config.subject, suffix)
    }

    /// Create a stream for `suffix` and publish `payloads` as `<prefix>.1..n`.
    async fn seed(&self, suffix: &str, payloads: Vec<Bytes>) -> Result<String> {
        let stream = self.stream_name(suffix);
        let prefix = self.subject_prefix(suffix);
        // Leftovers from an interrupted run would skew the counts
        let _ = self.broker.delete_stream(&stream).await;
        self.broker
            .create_stream(StreamConfig::new(&stream, [format!("{}.>", prefix)]))
            .await
            .wrap_err_with(|| format!("Failed to create stream {}", stream))?;

        for (i, payload) in payloads.into_iter().enumerate() {
            self.broker
                .publish(&format!("{}.{}", prefix, i + 1), payload)
                .await
                .wrap_err("Failed to publish")?;
        }
        Ok(stream)
    }

    fn filler_payloads(&self, count: usize) -> Vec<Bytes> {
        let payload: Vec<u8> = (b'0'..=b'9')
            .cycle()
            .take(self.config.payload_bytes)
            .collect();
        vec![Bytes::from(payload); count]
    }

    async fn teardown(&self, stream: &str) -> Result<()> {
        self.broker
            .delete_stream(stream)
            .await
            .wrap_err_with(|| format!("Failed to delete stream {}", stream))
    }

    /// Fetch everything `batch_size` at a time, then one more fetch that
    /// waits out the timeout. Returns the size of every batch, including
    /// the final empty one.
    pub async fn fetch_in_batches(&self) -> Result<Vec<usize>> {
        let stream = self
            .seed("batch", self.filler_payloads(self.config.messages))
            .await?;
        let session = ConsumerSession::open(self.broker.clone(), &stream, None, Some("event-consumer"))
            .await
            .wrap_err("Failed to open session")?;

        let mut sizes = Vec::new();
        loop {
            let request = BatchRequest::new(self.config.batch_size).with_timeout(self.config.fetch_timeout);
            let batch = session.fetch(request).await.wrap_err("Fetch failed")?;
            sizes.push(batch.len());
            if batch.is_drained() {
                break;
            }
            for message in &batch.messages {
                debug!(sequence = message.sequence, subject = %message.subject, "Received");
                ack_with_retry(&session, message).await?;
            }
        }
        info!(?sizes, "Fetched in batches");

        let drained = session.drain().await;
        if drained.unsettled > 0 {
            warn!(unsettled = drained.unsettled, "Session drained with outstanding acks");
        }
        self.teardown(&stream).await?;
        Ok(sizes)
    }

    /// Ask for 1000 messages but cap the batch by `max_bytes`.
    pub async fn byte_limited_fetch(&self) -> Result<ByteLimitedFetch> {
        let count = self.config.messages.max(20);
        let stream = self.seed("bytes", self.filler_payloads(count)).await?;
        let session = ConsumerSession::open(self.broker.clone(), &stream, None, None)
            .await
            .wrap_err("Failed to open session")?;

        let requested = 1000;
        let batch = session
            .fetch(
                BatchRequest::new(requested)
                    .with_max_bytes(self.config.max_bytes)
                    .with_timeout(self.config.fetch_timeout),
            )
            .await
            .wrap_err("Fetch failed")?;
        for message in &batch.messages {
            ack_with_retry(&session, message).await?;
        }

        let outcome = ByteLimitedFetch {
            requested,
            received: batch.len(),
            bytes: batch.total_bytes(),
        };
        info!(?outcome, max_bytes = self.config.max_bytes, "Byte-limited fetch");

        session.close();
        self.teardown(&stream).await?;
        Ok(outcome)
    }

    /// Two sessions on one durable consumer handling integer arrays
    /// concurrently. No sequence may reach both.
    pub async fn balanced_pair(&self) -> Result<BalancedOutcome> {
        let payloads = (1..=self.config.messages as i64)
            .map(|n| serde_json::to_vec(&[n, n * 2, n * 3]).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("Failed to encode payloads")?;
        let stream = self.seed("balanced", payloads).await?;

        let group = BalancedGroup::open(
            self.broker.clone(),
            &stream,
            ConsumerConfig::durable("balanced-consumer"),
            2,
        )
        .await
        .wrap_err("Failed to open balanced group")?;

        let handler = AveragingHandler::default();
        let plan = FetchPlan::until_drained(
            BatchRequest::new(self.config.batch_size).with_timeout(self.config.fetch_timeout),
        );
        let distribution = group
            .consume_concurrently(plan, &handler)
            .await
            .wrap_err("Balanced consumption failed")?;

        if distribution.has_duplicates() {
            return Err(eyre!("a message was delivered to both sessions"));
        }
        info!(
            per_session = ?distribution.per_session,
            handled = handler.handled.load(Ordering::Relaxed),
            "Balanced pair finished"
        );

        group.drain().await;
        self.teardown(&stream).await?;
        let averages = handler
            .averages
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(BalancedOutcome {
            distribution,
            averages,
        })
    }

    /// Delete the consumer behind a running fetch loop's back. Returns the
    /// number of messages the loop saw before it halted.
    pub async fn delete_while_fetching(&self) -> Result<usize> {
        let stream = self
            .seed("delete", self.filler_payloads(self.config.messages.max(2)))
            .await?;
        let session = ConsumerSession::open(self.broker.clone(), &stream, None, Some("doomed"))
            .await
            .wrap_err("Failed to open session")?;

        let messages = session.messages(FetchPlan::new(1, self.config.messages.max(2)));
        futures::pin_mut!(messages);

        let mut seen = 0;
        let mut halted = None;
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => {
                    seen += 1;
                    ack_with_retry(&session, &message).await?;
                    if seen == 1 {
                        self.broker
                            .delete_consumer(&stream, session.name())
                            .await
                            .wrap_err("Failed to delete consumer")?;
                    }
                }
                Err(e) => {
                    halted = Some(e);
                    break;
                }
            }
        }

        match halted {
            Some(e) if e.is_consumer_gone() => {
                info!(seen, error = %e, "Fetch loop halted after delete");
            }
            Some(e) => return Err(eyre::Report::new(e).wrap_err("Fetch loop failed for another reason")),
            None => return Err(eyre!("fetch loop ended without noticing the delete")),
        }

        self.teardown(&stream).await?;
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pull_consumer::InMemoryBroker;

    fn scenarios() -> Scenarios {
        Scenarios::new(Arc::new(InMemoryBroker::new()), DemoConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_in_batches() {
        let sizes = scenarios().fetch_in_batches().await.unwrap();
        assert_eq!(sizes, vec![2, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_byte_limited_fetch() {
        let outcome = scenarios().byte_limited_fetch().await.unwrap();
        assert_eq!(outcome.received, 6);
        assert!(outcome.bytes <= 300);
        assert!(outcome.received < outcome.requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balanced_pair() {
        let outcome = scenarios().balanced_pair().await.unwrap();
        assert_eq!(outcome.distribution.total(), 5);
        let mut averages = outcome.averages;
        averages.sort_by(f64::total_cmp);
        assert_eq!(averages, vec![2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_while_fetching() {
        let seen = scenarios().delete_while_fetching().await.unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenarios_run_back_to_back() {
        let scenarios = scenarios();
        scenarios.fetch_in_batches().await.unwrap();
        scenarios.fetch_in_batches().await.unwrap();
        scenarios.balanced_pair().await.unwrap();
    }
}

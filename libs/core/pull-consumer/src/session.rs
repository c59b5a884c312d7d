//! Consumer session: one consumer binding plus its local ack state.

use crate::ack::{AckState, AckSummary, AckTracker};
use crate::broker::{Broker, ConsumerHandle, ConsumerInfo};
use crate::config::{ConsumerConfig, FetchPlan};
use crate::error::{ErrorCategory, PullError, PullResult};
use crate::fetch::{BatchRequest, BatchResult, FetchStatus};
use crate::handler::MessageHandler;
use crate::message::{AckKind, Message};
use crate::metrics::ConsumerMetrics;
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long `drain` waits for outstanding acks by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle.
///
/// `Created -> Bound -> Fetching <-> Idle -> Draining -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Bound,
    Fetching,
    Idle,
    Draining,
    Closed,
}

impl SessionState {
    fn accepts_fetch(&self) -> bool {
        matches!(
            self,
            SessionState::Bound | SessionState::Fetching | SessionState::Idle
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Bound => write!(f, "bound"),
            SessionState::Fetching => write!(f, "fetching"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of [`ConsumerSession::consume`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Stream sequences in the order they were received.
    pub sequences: Vec<u64>,
    pub acked: usize,
    pub nacked: usize,
    pub terminated: usize,
}

impl ConsumeReport {
    pub fn received(&self) -> usize {
        self.sequences.len()
    }
}

/// Outcome of [`ConsumerSession::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Deliveries still un-acked and within their ack wait when the wait ended.
    pub unsettled: usize,
    pub summary: AckSummary,
}

/// A consumer binding used by one logical loop.
///
/// Fetching, acking and draining all take `&self`, so a session can be
/// shared by reference between a fetch loop and the tasks acking its
/// messages.
pub struct ConsumerSession {
    broker: Arc<dyn Broker>,
    consumer: ConsumerHandle,
    tracker: AckTracker,
    metrics: ConsumerMetrics,
    state: watch::Sender<SessionState>,
    drain_timeout: Duration,
}

impl ConsumerSession {
    /// Open a session on `stream`.
    ///
    /// With a `consumer_name` the consumer is durable and reused if it
    /// already exists. Without one the broker creates an ephemeral consumer
    /// that disappears after the default inactivity threshold.
    pub async fn open(
        broker: Arc<dyn Broker>,
        stream: &str,
        filter_subject: Option<&str>,
        consumer_name: Option<&str>,
    ) -> PullResult<Self> {
        let mut config = match consumer_name {
            Some(name) => ConsumerConfig::durable(name),
            None => ConsumerConfig::ephemeral(),
        };
        config.filter_subject = filter_subject.map(str::to_string);
        Self::open_with(broker, stream, config).await
    }

    /// Open a session with an explicit consumer configuration.
    pub async fn open_with(
        broker: Arc<dyn Broker>,
        stream: &str,
        config: ConsumerConfig,
    ) -> PullResult<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        let consumer = broker.create_or_bind_consumer(stream, config).await?;
        Ok(Self::bound(broker, consumer, state))
    }

    /// Bind to an existing consumer without creating it. The session tracks
    /// acks against the ack wait the broker reports for that consumer.
    pub async fn bind(broker: Arc<dyn Broker>, stream: &str, consumer_name: &str) -> PullResult<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        let consumer = broker.bind_consumer(stream, consumer_name).await?;
        Ok(Self::bound(broker, consumer, state))
    }

    fn bound(
        broker: Arc<dyn Broker>,
        consumer: ConsumerHandle,
        state: watch::Sender<SessionState>,
    ) -> Self {
        info!(
            stream = %consumer.stream,
            consumer = %consumer.name,
            durable = consumer.durable,
            "Session bound"
        );
        state.send_replace(SessionState::Bound);
        Self {
            metrics: ConsumerMetrics::new(&consumer.stream, &consumer.name),
            tracker: AckTracker::new(consumer.ack_wait),
            broker,
            consumer,
            state,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Set how long [`drain`](Self::drain) waits for outstanding acks.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn consumer(&self) -> &ConsumerHandle {
        &self.consumer
    }

    /// Consumer name (broker-assigned for ephemeral consumers).
    pub fn name(&self) -> &str {
        &self.consumer.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(consumer = %self.consumer.name, %from, %to, "Session state changed");
        }
    }

    fn check_open(&self) -> PullResult<()> {
        match self.state() {
            SessionState::Draining => Err(PullError::SessionClosed("draining")),
            SessionState::Closed => Err(PullError::SessionClosed("closed")),
            _ => Ok(()),
        }
    }

    /// Pull one batch. Every returned message is tracked as pending.
    pub async fn fetch(&self, request: BatchRequest) -> PullResult<BatchResult> {
        self.check_open()?;
        request.validate()?;
        self.transition(SessionState::Fetching);

        let start = Instant::now();
        let result = self.broker.fetch(&self.consumer, request).await;
        let duration = start.elapsed();

        self.state.send_if_modified(|state| {
            if *state == SessionState::Fetching {
                *state = SessionState::Idle;
                true
            } else {
                false
            }
        });

        match result {
            Ok(batch) => {
                for message in &batch.messages {
                    self.tracker.track(message);
                }
                self.metrics.fetch_completed(&batch, duration);
                self.metrics.ack_pending(self.tracker.pending_count());
                debug!(
                    consumer = %self.consumer.name,
                    count = batch.len(),
                    bytes = batch.total_bytes(),
                    status = %batch.status,
                    duration_ms = duration.as_millis(),
                    "Fetch completed"
                );
                Ok(batch)
            }
            Err(e) => {
                self.metrics.fetch_failed(&e);
                warn!(consumer = %self.consumer.name, error = %e, "Fetch failed");
                Err(e)
            }
        }
    }

    /// Lazily fetch messages until `plan` is satisfied or the queue is drained.
    ///
    /// Stops quietly when the session starts draining. A hard error ends the
    /// stream with [`PullError::Halted`].
    pub fn messages(&self, plan: FetchPlan) -> impl Stream<Item = PullResult<Message>> + '_ {
        try_stream! {
            let mut received = 0usize;
            let mut empty_polls = 0u32;
            let mut last_status: Option<FetchStatus> = None;

            while !plan.is_satisfied(received) && self.state().accepts_fetch() {
                let batch = self
                    .fetch(plan.next_request(received))
                    .await
                    .map_err(|e| PullError::halted("fetch", last_status, e))?;
                last_status = Some(batch.status);

                if batch.is_drained() {
                    empty_polls += 1;
                    if empty_polls >= plan.empty_polls {
                        debug!(consumer = %self.consumer.name, received, "No more messages");
                        break;
                    }
                    continue;
                }

                empty_polls = 0;
                for message in batch {
                    received += 1;
                    yield message;
                }
            }
        }
    }

    /// Run `handler` over messages pulled according to `plan`.
    ///
    /// Ack on success. A transient failure is nacked with backoff while the
    /// delivery count allows another attempt; anything else is terminated.
    pub async fn consume<H>(&self, plan: FetchPlan, handler: &H) -> PullResult<ConsumeReport>
    where
        H: MessageHandler + ?Sized,
    {
        let messages = self.messages(plan);
        futures::pin_mut!(messages);

        let mut report = ConsumeReport::default();
        while let Some(message) = messages.next().await {
            let message = message?;
            report.sequences.push(message.sequence);

            let result = handler.handle(&message).await;
            let retry_count = message.info.delivery_count.saturating_sub(1);
            match result {
                Ok(()) => {
                    self.ack(&message).await?;
                    report.acked += 1;
                }
                Err(e)
                    if e.category() == ErrorCategory::Transient && e.should_retry(retry_count) =>
                {
                    let delay = Duration::from_millis(e.backoff_delay_ms(retry_count));
                    warn!(
                        handler = handler.name(),
                        sequence = message.sequence,
                        retry_count,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Transient error, will retry"
                    );
                    self.nack(&message, Some(delay)).await?;
                    report.nacked += 1;
                }
                Err(e) => {
                    warn!(
                        handler = handler.name(),
                        sequence = message.sequence,
                        retry_count,
                        error = %e,
                        "Giving up on message"
                    );
                    self.term(&message).await?;
                    report.terminated += 1;
                }
            }
        }

        Ok(report)
    }

    async fn settle(&self, message: &Message, kind: AckKind, outcome: &'static str) -> PullResult<()> {
        if self.state() == SessionState::Closed {
            return Err(PullError::SessionClosed("closed"));
        }
        match self.tracker.settle(self.broker.as_ref(), message, kind).await {
            Ok(sent) => {
                if sent {
                    self.metrics.message_settled(outcome);
                    self.metrics.ack_pending(self.tracker.pending_count());
                    debug!(consumer = %self.consumer.name, sequence = message.sequence, outcome, "Message settled");
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.ack_failed();
                Err(e)
            }
        }
    }

    /// Acknowledge a message. Acking twice is a no-op.
    pub async fn ack(&self, message: &Message) -> PullResult<()> {
        self.settle(message, AckKind::Ack, "ack").await
    }

    /// Acknowledge and wait for the broker to confirm.
    pub async fn ack_sync(&self, message: &Message) -> PullResult<()> {
        self.settle(message, AckKind::AckSync, "ack_sync").await
    }

    /// Ask for redelivery, optionally after `delay`.
    pub async fn nack(&self, message: &Message, delay: Option<Duration>) -> PullResult<()> {
        self.settle(message, AckKind::Nak(delay), "nak").await
    }

    /// Stop redelivery of a message for good.
    pub async fn term(&self, message: &Message) -> PullResult<()> {
        self.settle(message, AckKind::Term, "term").await
    }

    /// Local ack state of a sequence delivered to this session.
    pub fn ack_state(&self, sequence: u64) -> Option<AckState> {
        self.tracker.state(sequence)
    }

    pub fn ack_summary(&self) -> AckSummary {
        self.tracker.summary()
    }

    /// Deliveries still waiting for an ack within their ack wait.
    pub fn pending_acks(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Whether the consumer still exists on the broker.
    pub async fn is_bound(&self) -> PullResult<bool> {
        match self
            .broker
            .bind_consumer(&self.consumer.stream, &self.consumer.name)
            .await
        {
            Ok(_) => Ok(true),
            Err(PullError::ConsumerNotFound(_) | PullError::StreamNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Consumer progress as seen by the broker.
    pub async fn info(&self) -> PullResult<ConsumerInfo> {
        self.broker.consumer_info(&self.consumer).await
    }

    /// Stop fetching, wait up to the drain timeout for outstanding acks, then
    /// close.
    pub async fn drain(&self) -> DrainReport {
        if self.state() != SessionState::Closed {
            self.transition(SessionState::Draining);
            let unsettled = self.tracker.wait_settled(self.drain_timeout).await;
            if unsettled > 0 {
                warn!(
                    consumer = %self.consumer.name,
                    unsettled,
                    "Drain timed out with unacked messages"
                );
            }
            self.transition(SessionState::Closed);
        }

        let report = DrainReport {
            unsettled: self.tracker.pending_count(),
            summary: self.tracker.summary(),
        };
        info!(consumer = %self.consumer.name, unsettled = report.unsettled, "Session drained");
        report
    }

    /// Close immediately. Unacked messages will be redelivered by the broker.
    pub fn close(&self) {
        if self.state() != SessionState::Closed {
            self.transition(SessionState::Closed);
            info!(
                consumer = %self.consumer.name,
                unsettled = self.tracker.pending_count(),
                "Session closed"
            );
        }
    }

    /// Delete the consumer on the broker and close the session.
    pub async fn delete(&self) -> PullResult<()> {
        self.broker
            .delete_consumer(&self.consumer.stream, &self.consumer.name)
            .await?;
        self.close();
        Ok(())
    }
}

impl fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("consumer", &self.consumer)
            .field("state", &self.state())
            .field("pending_acks", &self.tracker.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::config::DEFAULT_ACK_WAIT;
    use crate::message::test_message;

    fn handle() -> ConsumerHandle {
        ConsumerHandle {
            stream: "EVENTS".to_string(),
            name: "event-consumer".to_string(),
            durable: true,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }

    fn mock_with_consumer() -> MockBroker {
        let mut broker = MockBroker::new();
        broker
            .expect_create_or_bind_consumer()
            .returning(|_, _| Ok(handle()));
        broker
    }

    #[tokio::test]
    async fn test_open_builds_durable_config() {
        let mut broker = MockBroker::new();
        broker
            .expect_create_or_bind_consumer()
            .withf(|stream, config| {
                stream == "EVENTS"
                    && config.durable_name.as_deref() == Some("event-consumer")
                    && config.filter_subject.as_deref() == Some("event.>")
            })
            .times(1)
            .returning(|_, _| Ok(handle()));

        let session = ConsumerSession::open(
            Arc::new(broker),
            "EVENTS",
            Some("event.>"),
            Some("event-consumer"),
        )
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(session.name(), "event-consumer");
    }

    #[tokio::test]
    async fn test_fetch_error_halts_stream_with_context() {
        let mut broker = mock_with_consumer();
        let mut calls = 0;
        broker.expect_fetch().returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(BatchResult::ok(vec![test_message(1, "event.1", b"a")]))
            } else {
                Err(PullError::Connection("reset by peer".to_string()))
            }
        });

        let session = ConsumerSession::open(Arc::new(broker), "EVENTS", None, Some("event-consumer"))
            .await
            .unwrap();
        let results: Vec<_> = session.messages(FetchPlan::new(1, 5)).collect().await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(PullError::Halted {
                operation,
                last_status,
                source,
            }) => {
                assert_eq!(*operation, "fetch");
                assert_eq!(*last_status, Some(FetchStatus::Ok));
                assert!(matches!(**source, PullError::Connection(_)));
            }
            other => panic!("expected halted error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_session_rejects_fetch_and_ack() {
        let mut broker = mock_with_consumer();
        broker.expect_fetch().never();
        broker.expect_ack().never();

        let session = ConsumerSession::open(Arc::new(broker), "EVENTS", None, Some("event-consumer"))
            .await
            .unwrap();
        session.close();

        let fetch = session.fetch(BatchRequest::new(1)).await;
        assert!(matches!(fetch, Err(PullError::SessionClosed("closed"))));
        let ack = session.ack(&test_message(1, "event.1", b"a")).await;
        assert!(matches!(ack, Err(PullError::SessionClosed("closed"))));
    }

    #[tokio::test]
    async fn test_is_bound_maps_not_found() {
        let mut broker = mock_with_consumer();
        broker
            .expect_bind_consumer()
            .returning(|_, name| Err(PullError::ConsumerNotFound(name.to_string())));

        let session = ConsumerSession::open(Arc::new(broker), "EVENTS", None, Some("event-consumer"))
            .await
            .unwrap();
        assert!(!session.is_bound().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_acks() {
        let mut broker = mock_with_consumer();
        broker
            .expect_fetch()
            .returning(|_, _| Ok(BatchResult::ok(vec![test_message(1, "event.1", b"a")])));
        broker.expect_ack().returning(|_, _| Ok(()));

        let session = ConsumerSession::open(Arc::new(broker), "EVENTS", None, Some("event-consumer"))
            .await
            .unwrap();
        let batch = session.fetch(BatchRequest::new(1)).await.unwrap();
        let message = batch.messages[0].clone();

        let (report, ack) = tokio::join!(session.drain(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.ack(&message).await
        });
        ack.unwrap();
        assert_eq!(report.unsettled, 0);
        assert_eq!(report.summary.acked, 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let mut broker = mock_with_consumer();
        broker
            .expect_fetch()
            .returning(|_, _| Ok(BatchResult::ok(vec![test_message(1, "event.1", b"a")])));

        let session = ConsumerSession::open(Arc::new(broker), "EVENTS", None, Some("event-consumer"))
            .await
            .unwrap()
            .with_drain_timeout(Duration::from_millis(250));
        session.fetch(BatchRequest::new(1)).await.unwrap();

        let start = Instant::now();
        let report = session.drain().await;
        assert_eq!(report.unsettled, 1);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}

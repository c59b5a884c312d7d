//! In-process broker.
//!
//! Implements the broker-side rules the consumer core depends on: one
//! delivery per message among all sessions bound to a consumer, redelivery
//! after the ack wait, ephemeral consumer expiry, request limits and stream
//! retention. Used by the test suites and by the demo when no NATS server is
//! configured.

use crate::broker::{
    subject_matches, subjects_overlap, Broker, ConsumerHandle, ConsumerInfo, PublishAck,
    StreamHandle, StreamInfo,
};
use crate::config::{ConsumerConfig, RetentionPolicy, StreamConfig};
use crate::error::{PullError, PullResult};
use crate::fetch::{deadline_after, Admission, BatchBudget, BatchRequest, BatchResult};
use crate::message::{AckHandle, AckKind, DeliveryInfo, Message};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
}

#[derive(Debug)]
struct PendingDelivery {
    delivery_count: u32,
    deadline: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    name: String,
    config: ConsumerConfig,
    /// Highest stream sequence considered for first delivery.
    cursor: u64,
    pending: BTreeMap<u64, PendingDelivery>,
    redeliver: BTreeSet<u64>,
    delivery_counts: HashMap<u64, u32>,
    /// Acked or terminated sequences still stored (interest retention
    /// bookkeeping).
    acked: BTreeSet<u64>,
    last_active: Instant,
    waiting: usize,
}

impl ConsumerState {
    fn new(name: String, config: ConsumerConfig, now: Instant) -> Self {
        Self {
            name,
            config,
            cursor: 0,
            pending: BTreeMap::new(),
            redeliver: BTreeSet::new(),
            delivery_counts: HashMap::new(),
            acked: BTreeSet::new(),
            last_active: now,
            waiting: 0,
        }
    }

    fn filter(&self) -> &str {
        self.config.filter_subject.as_deref().unwrap_or(">")
    }

    fn wants(&self, subject: &str) -> bool {
        subject_matches(self.filter(), subject)
    }

    fn handle(&self, stream: &str) -> ConsumerHandle {
        ConsumerHandle {
            stream: stream.to_string(),
            name: self.name.clone(),
            durable: self.config.is_durable(),
            ack_wait: self.config.ack_wait,
        }
    }

    /// Queue `sequence` for another delivery unless it ran out of attempts.
    fn requeue(&mut self, sequence: u64) {
        let delivered = self.delivery_counts.get(&sequence).copied().unwrap_or(0);
        match self.config.max_deliver {
            Some(max) if delivered >= max => {
                debug!(
                    consumer = %self.name,
                    sequence,
                    delivered,
                    "Max deliveries reached, not redelivering"
                );
            }
            _ => {
                self.redeliver.insert(sequence);
            }
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, delivery)| delivery.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in expired {
            self.pending.remove(&sequence);
            self.requeue(sequence);
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        !self.config.is_durable()
            && self.waiting == 0
            && now.saturating_duration_since(self.last_active) >= self.config.inactive_threshold
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|delivery| delivery.deadline).min()
    }

    fn check_request(&self, request: &BatchRequest) -> PullResult<()> {
        if let Some(max) = self.config.max_request_batch {
            if request.max_count > max {
                return Err(PullError::protocol(format!(
                    "exceeded MaxRequestBatch of {}",
                    max
                )));
            }
        }
        if let Some(max) = self.config.max_request_expires {
            if !request.no_wait && request.timeout > max {
                return Err(PullError::protocol(format!(
                    "exceeded MaxRequestExpires of {:?}",
                    max
                )));
            }
        }
        if let (Some(max), Some(requested)) =
            (self.config.max_request_max_bytes, request.max_bytes)
        {
            if requested > max {
                return Err(PullError::protocol(format!(
                    "exceeded MaxRequestMaxBytes of {}",
                    max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence: 0,
            consumers: HashMap::new(),
        }
    }

    fn wants(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
    }

    fn housekeeping(&mut self, now: Instant) {
        for consumer in self.consumers.values_mut() {
            consumer.expire_pending(now);
        }

        let stream = &self.config.name;
        self.consumers.retain(|name, consumer| {
            let expired = consumer.is_expired(now);
            if expired {
                info!(stream = %stream, consumer = %name, "Ephemeral consumer expired");
            }
            !expired
        });
    }

    /// Apply retention after `sequence` was acked or terminated.
    fn settled(&mut self, sequence: u64) {
        match self.config.retention {
            RetentionPolicy::Limits => {}
            RetentionPolicy::WorkQueue => self.remove_message(sequence),
            RetentionPolicy::Interest => {
                let Some(subject) = self.messages.get(&sequence).map(|m| m.subject.clone()) else {
                    return;
                };
                let everyone_done = self
                    .consumers
                    .values()
                    .filter(|consumer| consumer.wants(&subject))
                    .all(|consumer| consumer.acked.contains(&sequence));
                if everyone_done {
                    self.remove_message(sequence);
                }
            }
        }
    }

    fn remove_message(&mut self, sequence: u64) {
        self.messages.remove(&sequence);
        for consumer in self.consumers.values_mut() {
            consumer.acked.remove(&sequence);
            consumer.redeliver.remove(&sequence);
        }
    }

    /// Pick messages for `consumer` according to `request`.
    fn select(
        &mut self,
        consumer_name: &str,
        request: &BatchRequest,
        now: Instant,
    ) -> PullResult<Vec<Message>> {
        let stream_name = self.config.name.clone();
        let StreamState {
            messages,
            consumers,
            ..
        } = self;
        let Some(consumer) = consumers.get_mut(consumer_name) else {
            return Err(PullError::consumer_gone(stream_name, consumer_name));
        };

        let mut budget = BatchBudget::new(request);
        let mut capacity = consumer
            .config
            .max_ack_pending
            .map(|max| max.saturating_sub(consumer.pending.len()))
            .unwrap_or(usize::MAX);
        let mut chosen = Vec::new();

        let mut offer = |sequence: u64, size: usize, chosen: &mut Vec<u64>| -> PullResult<bool> {
            if capacity == 0 {
                return Ok(false);
            }
            match budget.admit(size) {
                Admission::Admitted => {
                    capacity -= 1;
                    chosen.push(sequence);
                    Ok(true)
                }
                Admission::Full => Ok(false),
                Admission::TooLarge => Err(PullError::protocol(format!(
                    "message size {} exceeds max bytes {}",
                    size,
                    request.max_bytes.unwrap_or_default()
                ))),
            }
        };

        let mut full = false;
        let redeliveries: Vec<u64> = consumer.redeliver.iter().copied().collect();
        for sequence in redeliveries {
            let Some(stored) = messages.get(&sequence) else {
                consumer.redeliver.remove(&sequence);
                continue;
            };
            if !offer(sequence, stored.payload.len(), &mut chosen)? {
                full = true;
                break;
            }
            consumer.redeliver.remove(&sequence);
        }

        if !full {
            for (sequence, stored) in messages.range(consumer.cursor + 1..) {
                if !consumer.wants(&stored.subject) {
                    consumer.cursor = *sequence;
                    continue;
                }
                if !offer(*sequence, stored.payload.len(), &mut chosen)? {
                    break;
                }
                consumer.cursor = *sequence;
            }
        }

        let deadline = deadline_after(now, consumer.config.ack_wait);
        let delivered = chosen
            .into_iter()
            .filter_map(|sequence| {
                let stored = messages.get(&sequence)?;
                let count = consumer.delivery_counts.entry(sequence).or_insert(0);
                *count += 1;
                consumer.pending.insert(
                    sequence,
                    PendingDelivery {
                        delivery_count: *count,
                        deadline,
                    },
                );
                Some(Message {
                    subject: stored.subject.clone(),
                    payload: stored.payload.clone(),
                    sequence,
                    info: DeliveryInfo {
                        stream: stream_name.clone(),
                        consumer: consumer.name.clone(),
                        delivery_count: *count,
                    },
                })
            })
            .collect();

        Ok(delivered)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    disconnected: bool,
}

impl BrokerState {
    fn check_connected(&self) -> PullResult<()> {
        if self.disconnected {
            Err(PullError::Connection("not connected".to_string()))
        } else {
            Ok(())
        }
    }

    fn stream_mut(&mut self, name: &str) -> PullResult<&mut StreamState> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| PullError::StreamNotFound(name.to_string()))
    }
}

enum Attempt {
    Ready(BatchResult),
    Wait(Option<Instant>),
}

/// Reference broker living in the current process.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a lost connection: every call fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.changed.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }

    fn begin_wait(&self, consumer: &ConsumerHandle, request: &BatchRequest) -> PullResult<()> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(&consumer.stream)?;
        stream.housekeeping(now);
        let Some(entry) = stream.consumers.get_mut(&consumer.name) else {
            return Err(PullError::consumer_gone(&consumer.stream, &consumer.name));
        };
        entry.check_request(request)?;
        if let Some(max) = entry.config.max_waiting {
            if entry.waiting >= max {
                return Err(PullError::protocol(format!("exceeded MaxWaiting of {}", max)));
            }
        }
        entry.waiting += 1;
        entry.last_active = now;
        Ok(())
    }

    fn end_wait(&self, consumer: &ConsumerHandle) {
        let now = Instant::now();
        let mut state = self.lock();
        if let Some(entry) = state
            .streams
            .get_mut(&consumer.stream)
            .and_then(|stream| stream.consumers.get_mut(&consumer.name))
        {
            entry.waiting = entry.waiting.saturating_sub(1);
            entry.last_active = now;
        }
    }

    fn try_fetch(&self, consumer: &ConsumerHandle, request: &BatchRequest) -> PullResult<Attempt> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state
            .streams
            .get_mut(&consumer.stream)
            .ok_or_else(|| PullError::consumer_gone(&consumer.stream, &consumer.name))?;
        stream.housekeeping(now);

        let messages = stream.select(&consumer.name, request, now)?;
        if !messages.is_empty() {
            return Ok(Attempt::Ready(BatchResult::ok(messages)));
        }
        if request.no_wait {
            return Ok(Attempt::Ready(BatchResult::timeout()));
        }
        let next_deadline = stream
            .consumers
            .get(&consumer.name)
            .and_then(ConsumerState::next_deadline);
        Ok(Attempt::Wait(next_deadline))
    }
}

/// Decrements the waiting counter when a fetch finishes or is dropped.
struct WaitingGuard<'a> {
    broker: &'a InMemoryBroker,
    consumer: &'a ConsumerHandle,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.broker.end_wait(self.consumer);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_stream(&self, config: StreamConfig) -> PullResult<StreamHandle> {
        config.validate()?;
        let mut state = self.lock();
        state.check_connected()?;

        if let Some(existing) = state.streams.get(&config.name) {
            if existing.config == config {
                return Ok(StreamHandle { name: config.name });
            }
            return Err(PullError::from_broker_error(format!(
                "stream name '{}' already in use with a different configuration",
                config.name
            )));
        }

        let overlapping = state.streams.values().any(|stream| {
            stream.config.subjects.iter().any(|existing| {
                config
                    .subjects
                    .iter()
                    .any(|subject| subjects_overlap(existing, subject))
            })
        });
        if overlapping {
            return Err(PullError::from_broker_error(format!(
                "subjects of stream '{}' overlap with an existing stream",
                config.name
            )));
        }

        info!(stream = %config.name, subjects = ?config.subjects, "Stream created");
        let handle = StreamHandle {
            name: config.name.clone(),
        };
        state
            .streams
            .insert(config.name.clone(), StreamState::new(config));
        Ok(handle)
    }

    async fn delete_stream(&self, name: &str) -> PullResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        state
            .streams
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PullError::StreamNotFound(name.to_string()))?;
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> PullResult<PublishAck> {
        let mut state = self.lock();
        state.check_connected()?;

        let Some(stream) = state.streams.values_mut().find(|stream| stream.wants(subject)) else {
            return Err(PullError::Publish(format!(
                "no stream matches subject '{}'",
                subject
            )));
        };

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;

        let interested = stream.config.retention != RetentionPolicy::Interest
            || stream.consumers.values().any(|consumer| consumer.wants(subject));
        if interested {
            stream.messages.insert(
                sequence,
                StoredMessage {
                    subject: subject.to_string(),
                    payload,
                },
            );
        }

        if let Some(max) = stream.config.max_messages {
            while stream.messages.len() as u64 > max {
                let Some(oldest) = stream.messages.keys().next().copied() else {
                    break;
                };
                stream.remove_message(oldest);
            }
        }

        let ack = PublishAck {
            stream: stream.config.name.clone(),
            sequence,
        };
        drop(state);
        self.changed.notify_waiters();
        Ok(ack)
    }

    async fn create_or_bind_consumer(
        &self,
        stream_name: &str,
        config: ConsumerConfig,
    ) -> PullResult<ConsumerHandle> {
        config.validate()?;
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(stream_name)?;
        stream.housekeeping(now);

        if let Some(name) = config.durable_name.clone() {
            if let Some(existing) = stream.consumers.get_mut(&name) {
                // MaxWaiting is fixed at creation time.
                let max_waiting = existing.config.max_waiting;
                existing.config = ConsumerConfig {
                    max_waiting,
                    ..config
                };
                existing.last_active = now;
                debug!(stream = %stream_name, consumer = %name, "Bound to existing consumer");
                return Ok(existing.handle(stream_name));
            }
        }

        if stream.config.retention == RetentionPolicy::WorkQueue {
            let filter = config.filter_subject.as_deref().unwrap_or(">");
            let clash = stream
                .consumers
                .values()
                .any(|existing| subjects_overlap(existing.filter(), filter));
            if clash {
                return Err(PullError::from_broker_error(
                    "filtered consumer not unique on workqueue stream",
                ));
            }
        }

        let name = config
            .durable_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let consumer = ConsumerState::new(name.clone(), config, now);
        let handle = consumer.handle(stream_name);
        info!(
            stream = %stream_name,
            consumer = %name,
            durable = handle.durable,
            "Consumer created"
        );
        stream.consumers.insert(name, consumer);
        Ok(handle)
    }

    async fn bind_consumer(&self, stream_name: &str, name: &str) -> PullResult<ConsumerHandle> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(stream_name)?;
        stream.housekeeping(now);
        stream
            .consumers
            .get(name)
            .map(|consumer| consumer.handle(stream_name))
            .ok_or_else(|| PullError::ConsumerNotFound(name.to_string()))
    }

    async fn fetch(
        &self,
        consumer: &ConsumerHandle,
        request: BatchRequest,
    ) -> PullResult<BatchResult> {
        request.validate()?;
        let deadline = deadline_after(Instant::now(), request.timeout);

        self.begin_wait(consumer, &request)?;
        let _waiting = WaitingGuard {
            broker: self,
            consumer,
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = match self.try_fetch(consumer, &request)? {
                Attempt::Ready(batch) => return Ok(batch),
                Attempt::Wait(next_deadline) => next_deadline,
            };

            if Instant::now() >= deadline {
                return Ok(BatchResult::timeout());
            }
            let wake = next_deadline.map_or(deadline, |next| next.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn ack(&self, handle: &AckHandle, kind: AckKind) -> PullResult<()> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let Some(stream) = state.streams.get_mut(&handle.stream) else {
            return Err(PullError::consumer_gone(&handle.stream, &handle.consumer));
        };
        stream.housekeeping(now);
        let Some(consumer) = stream.consumers.get_mut(&handle.consumer) else {
            return Err(PullError::consumer_gone(&handle.stream, &handle.consumer));
        };

        let current = consumer.delivery_counts.get(&handle.sequence).copied();
        let in_flight = consumer.pending.contains_key(&handle.sequence)
            || consumer.redeliver.contains(&handle.sequence);
        if !in_flight || current != Some(handle.delivery_count) {
            debug!(
                consumer = %handle.consumer,
                sequence = handle.sequence,
                "Ignoring ack for a delivery that is no longer outstanding"
            );
            return Ok(());
        }

        consumer.last_active = now;
        if kind.is_final() {
            consumer.pending.remove(&handle.sequence);
            consumer.redeliver.remove(&handle.sequence);
            consumer.acked.insert(handle.sequence);
            stream.settled(handle.sequence);
        } else {
            match kind {
                AckKind::Nak(Some(delay)) if !delay.is_zero() => {
                    if let Some(delivery) = consumer.pending.get_mut(&handle.sequence) {
                        delivery.deadline = deadline_after(now, delay);
                    }
                }
                _ => {
                    consumer.pending.remove(&handle.sequence);
                    consumer.requeue(handle.sequence);
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn consumer_info(&self, consumer: &ConsumerHandle) -> PullResult<ConsumerInfo> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(&consumer.stream)?;
        stream.housekeeping(now);
        let entry = stream
            .consumers
            .get(&consumer.name)
            .ok_or_else(|| PullError::ConsumerNotFound(consumer.name.clone()))?;

        let num_pending = stream
            .messages
            .range(entry.cursor + 1..)
            .filter(|(_, stored)| entry.wants(&stored.subject))
            .count() as u64;

        Ok(ConsumerInfo {
            stream: consumer.stream.clone(),
            name: entry.name.clone(),
            durable: entry.config.is_durable(),
            num_pending,
            num_ack_pending: entry.pending.len(),
            num_redelivered: entry.redeliver.len(),
            num_waiting: entry.waiting,
        })
    }

    async fn stream_info(&self, name: &str) -> PullResult<StreamInfo> {
        let now = Instant::now();
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(name)?;
        stream.housekeeping(now);

        Ok(StreamInfo {
            name: name.to_string(),
            messages: stream.messages.len() as u64,
            bytes: stream
                .messages
                .values()
                .map(|stored| stored.payload.len() as u64)
                .sum(),
            first_sequence: stream
                .messages
                .keys()
                .next()
                .copied()
                .unwrap_or(stream.last_sequence),
            last_sequence: stream.last_sequence,
            consumer_count: stream.consumers.len(),
        })
    }

    async fn delete_consumer(&self, stream_name: &str, name: &str) -> PullResult<()> {
        let mut state = self.lock();
        state.check_connected()?;
        let stream = state.stream_mut(stream_name)?;
        stream
            .consumers
            .remove(name)
            .ok_or_else(|| PullError::ConsumerNotFound(name.to_string()))?;
        info!(stream = %stream_name, consumer = %name, "Consumer deleted");
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }
}

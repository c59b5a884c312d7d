//! NATS JetStream implementation of [`Broker`].

use crate::broker::{Broker, ConsumerHandle, ConsumerInfo, PublishAck, StreamHandle, StreamInfo};
use crate::config::{ConsumerConfig, RetentionPolicy, StreamConfig};
use crate::error::{PullError, PullResult};
use crate::fetch::{deadline_after, BatchRequest, BatchResult};
use crate::message::{AckHandle, AckKind, DeliveryInfo, Message};
use async_nats::jetstream::consumer::{pull, AckPolicy, Consumer};
use async_nats::jetstream::{self, stream, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type ConsumerKey = (String, String);
type DeliveryKey = (String, String, u64);

/// Connection settings for [`NatsBroker::connect`].
#[derive(Debug, Clone, Default)]
pub struct NatsConnectOptions {
    pub url: String,
    pub client_name: Option<String>,
    pub user_and_password: Option<(String, String)>,
    pub token: Option<String>,
    pub credentials_file: Option<String>,
    pub connect_timeout: Option<Duration>,
}

impl NatsConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Broker backed by a NATS server with JetStream enabled.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: Context,
    consumers: Mutex<HashMap<ConsumerKey, Consumer<pull::Config>>>,
    /// Last delivery per sequence, kept until it is settled.
    deliveries: Mutex<HashMap<DeliveryKey, (u32, jetstream::Message)>>,
}

impl NatsBroker {
    /// Connect to the server described by `options`.
    pub async fn connect(options: &NatsConnectOptions) -> PullResult<Self> {
        let mut connect = async_nats::ConnectOptions::new();
        if let Some(name) = &options.client_name {
            connect = connect.name(name);
        }
        if let Some(timeout) = options.connect_timeout {
            connect = connect.connection_timeout(timeout);
        }
        if let Some((user, password)) = &options.user_and_password {
            connect = connect.user_and_password(user.clone(), password.clone());
        }
        if let Some(token) = &options.token {
            connect = connect.token(token.clone());
        }
        if let Some(path) = &options.credentials_file {
            connect = connect
                .credentials_file(path)
                .await
                .map_err(|e| PullError::Config(format!("failed to read credentials: {}", e)))?;
        }

        let client = connect
            .connect(options.url.as_str())
            .await
            .map_err(|e| PullError::Connection(e.to_string()))?;
        info!(url = %options.url, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Wrap an existing client.
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            jetstream: jetstream::new(client.clone()),
            client,
            consumers: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying core client, for request/reply outside JetStream.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn consumers(&self) -> MutexGuard<'_, HashMap<ConsumerKey, Consumer<pull::Config>>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliveries(&self) -> MutexGuard<'_, HashMap<DeliveryKey, (u32, jetstream::Message)>> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stream(&self, name: &str) -> PullResult<stream::Stream> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| classify(e, || PullError::StreamNotFound(name.to_string())))
    }

    async fn consumer(&self, handle: &ConsumerHandle) -> PullResult<Consumer<pull::Config>> {
        let key = (handle.stream.clone(), handle.name.clone());
        if let Some(consumer) = self.consumers().get(&key) {
            return Ok(consumer.clone());
        }

        let consumer = self
            .stream(&handle.stream)
            .await
            .map_err(|_| PullError::consumer_gone(&handle.stream, &handle.name))?
            .get_consumer::<pull::Config>(&handle.name)
            .await
            .map_err(|e| classify(e, || PullError::consumer_gone(&handle.stream, &handle.name)))?;
        self.consumers().insert(key, consumer.clone());
        Ok(consumer)
    }

    fn convert(&self, handle: &ConsumerHandle, message: jetstream::Message) -> PullResult<Message> {
        let info = message.info().map_err(|e| PullError::protocol(e.to_string()))?;
        let sequence = info.stream_sequence;
        let delivery_count = u32::try_from(info.delivered).unwrap_or(u32::MAX);
        let converted = Message {
            subject: message.subject.to_string(),
            payload: message.payload.clone(),
            sequence,
            info: DeliveryInfo {
                stream: handle.stream.clone(),
                consumer: handle.name.clone(),
                delivery_count,
            },
        };

        self.deliveries().insert(
            (handle.stream.clone(), handle.name.clone(), sequence),
            (delivery_count, message),
        );
        Ok(converted)
    }

    /// Move messages from `batch` into `out`, up to `limit`.
    ///
    /// With `wait_for_rest` unset, stops at the first point where no further
    /// message is ready, as long as at least one arrived.
    async fn drain_batch(
        &self,
        handle: &ConsumerHandle,
        batch: Result<pull::Batch, impl std::fmt::Display>,
        limit: usize,
        wait_for_rest: bool,
        out: &mut Vec<Message>,
    ) -> PullResult<()> {
        let mut batch = batch.map_err(|e| classify(e, || PullError::consumer_gone(&handle.stream, &handle.name)))?;
        while out.len() < limit {
            let next = if wait_for_rest || out.is_empty() {
                batch.next().await
            } else {
                match batch.next().now_or_never() {
                    Some(next) => next,
                    None => break,
                }
            };
            match next {
                Some(Ok(message)) => out.push(self.convert(handle, message)?),
                Some(Err(e)) => {
                    return Err(classify(e, || {
                        PullError::consumer_gone(&handle.stream, &handle.name)
                    }))
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Map a client error, substituting `not_found` when the server reports a
/// missing stream or consumer.
fn classify(error: impl std::fmt::Display, not_found: impl FnOnce() -> PullError) -> PullError {
    let text = error.to_string();
    let lower = text.to_lowercase();
    if lower.contains("not found") || lower.contains("consumer deleted") {
        not_found()
    } else if lower.contains("exceeds") || lower.contains("exceeded") {
        PullError::Protocol(text)
    } else if lower.contains("disconnected") || lower.contains("connection") {
        PullError::Connection(text)
    } else {
        PullError::Broker(text)
    }
}

fn to_i64<T: TryInto<i64>>(value: Option<T>) -> i64 {
    value.and_then(|v| v.try_into().ok()).unwrap_or(-1)
}

#[async_trait]
impl Broker for NatsBroker {
    async fn create_stream(&self, config: StreamConfig) -> PullResult<StreamHandle> {
        config.validate()?;
        let retention = match config.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        };

        self.jetstream
            .get_or_create_stream(stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention,
                max_messages: to_i64(config.max_messages),
                ..Default::default()
            })
            .await
            .map_err(PullError::from_broker_error)?;

        info!(stream = %config.name, subjects = ?config.subjects, "Stream ready");
        Ok(StreamHandle { name: config.name })
    }

    async fn delete_stream(&self, name: &str) -> PullResult<()> {
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(|e| classify(e, || PullError::StreamNotFound(name.to_string())))?;
        self.consumers().retain(|(stream, _), _| stream != name);
        self.deliveries().retain(|(stream, _, _), _| stream != name);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> PullResult<PublishAck> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| PullError::Publish(e.to_string()))?
            .await
            .map_err(|e| PullError::Publish(e.to_string()))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn create_or_bind_consumer(
        &self,
        stream_name: &str,
        config: ConsumerConfig,
    ) -> PullResult<ConsumerHandle> {
        config.validate()?;
        let stream = self.stream(stream_name).await?;
        let durable = config.is_durable();

        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: config.durable_name.clone(),
                name: config.durable_name.clone(),
                filter_subject: config.filter_subject.clone().unwrap_or_default(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: config.ack_wait,
                max_deliver: to_i64(config.max_deliver),
                max_ack_pending: to_i64(config.max_ack_pending),
                max_waiting: to_i64(config.max_waiting),
                max_batch: to_i64(config.max_request_batch).max(0),
                max_expires: config.max_request_expires.unwrap_or_default(),
                max_bytes: to_i64(config.max_request_max_bytes).max(0),
                inactive_threshold: if durable {
                    Duration::ZERO
                } else {
                    config.inactive_threshold
                },
                ..Default::default()
            })
            .await
            .map_err(PullError::from_broker_error)?;

        let name = consumer.cached_info().name.clone();
        let ack_wait = consumer.cached_info().config.ack_wait;
        info!(stream = %stream_name, consumer = %name, durable, "Consumer ready");
        self.consumers()
            .insert((stream_name.to_string(), name.clone()), consumer);

        Ok(ConsumerHandle {
            stream: stream_name.to_string(),
            name,
            durable,
            ack_wait,
        })
    }

    async fn bind_consumer(&self, stream_name: &str, name: &str) -> PullResult<ConsumerHandle> {
        let consumer = self
            .stream(stream_name)
            .await?
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|e| classify(e, || PullError::ConsumerNotFound(name.to_string())))?;

        let durable = consumer.cached_info().config.durable_name.is_some();
        let ack_wait = consumer.cached_info().config.ack_wait;
        self.consumers()
            .insert((stream_name.to_string(), name.to_string()), consumer);
        Ok(ConsumerHandle {
            stream: stream_name.to_string(),
            name: name.to_string(),
            durable,
            ack_wait,
        })
    }

    /// Buffered messages are pulled with a no-wait request first. If none are
    /// buffered, an expiring pull waits for the first message and then returns
    /// with whatever else is already ready. Messages the server sends for that
    /// pull after it returns stay unacked and come back after the ack wait.
    async fn fetch(
        &self,
        handle: &ConsumerHandle,
        request: BatchRequest,
    ) -> PullResult<BatchResult> {
        request.validate()?;
        let deadline = deadline_after(Instant::now(), request.timeout);
        let consumer = self.consumer(handle).await?;
        let mut messages = Vec::new();

        // Anything already buffered comes back without waiting.
        let mut buffered = consumer.fetch().max_messages(request.max_count);
        if let Some(max_bytes) = request.max_bytes {
            buffered = buffered.max_bytes(max_bytes);
        }
        self.drain_batch(handle, buffered.messages().await, request.max_count, true, &mut messages)
            .await?;

        if messages.is_empty() && !request.no_wait {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                let mut waiting = consumer
                    .batch()
                    .max_messages(request.max_count)
                    .expires(remaining);
                if let Some(max_bytes) = request.max_bytes {
                    waiting = waiting.max_bytes(max_bytes);
                }
                self.drain_batch(handle, waiting.messages().await, request.max_count, false, &mut messages)
                    .await?;
            }
        }

        debug!(consumer = %handle.name, count = messages.len(), "Fetched from JetStream");
        Ok(BatchResult::ok(messages))
    }

    async fn ack(&self, handle: &AckHandle, kind: AckKind) -> PullResult<()> {
        let key = (
            handle.stream.clone(),
            handle.consumer.clone(),
            handle.sequence,
        );
        let message = match self.deliveries().get(&key) {
            Some((count, message)) if *count == handle.delivery_count => message.clone(),
            _ => {
                debug!(
                    consumer = %handle.consumer,
                    sequence = handle.sequence,
                    "Ignoring ack for a delivery that is no longer outstanding"
                );
                return Ok(());
            }
        };

        let result = match kind {
            AckKind::Ack => message.ack().await,
            AckKind::AckSync => message.double_ack().await,
            AckKind::Nak(delay) => message.ack_with(jetstream::AckKind::Nak(delay)).await,
            AckKind::Term => message.ack_with(jetstream::AckKind::Term).await,
        };
        if let Err(e) = result {
            warn!(sequence = handle.sequence, error = %e, "JetStream ack failed");
            return Err(PullError::ack(handle.sequence, e.to_string()));
        }

        let mut deliveries = self.deliveries();
        if deliveries
            .get(&key)
            .is_some_and(|(count, _)| *count == handle.delivery_count)
        {
            deliveries.remove(&key);
        }
        Ok(())
    }

    async fn consumer_info(&self, handle: &ConsumerHandle) -> PullResult<ConsumerInfo> {
        let mut consumer = self.consumer(handle).await?;
        let info = consumer
            .info()
            .await
            .map_err(|e| classify(e, || PullError::ConsumerNotFound(handle.name.clone())))?;

        Ok(ConsumerInfo {
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            durable: info.config.durable_name.is_some(),
            num_pending: info.num_pending,
            num_ack_pending: info.num_ack_pending,
            num_redelivered: info.num_redelivered,
            num_waiting: info.num_waiting,
        })
    }

    async fn stream_info(&self, name: &str) -> PullResult<StreamInfo> {
        let mut stream = self.stream(name).await?;
        let info = stream.info().await.map_err(PullError::from_broker_error)?;

        Ok(StreamInfo {
            name: name.to_string(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    async fn delete_consumer(&self, stream_name: &str, name: &str) -> PullResult<()> {
        self.stream(stream_name)
            .await?
            .delete_consumer(name)
            .await
            .map_err(|e| classify(e, || PullError::ConsumerNotFound(name.to_string())))?;

        self.consumers()
            .remove(&(stream_name.to_string(), name.to_string()));
        self.deliveries()
            .retain(|(stream, consumer, _), _| !(stream == stream_name && consumer == name));
        info!(stream = %stream_name, consumer = %name, "Consumer deleted");
        Ok(())
    }
}

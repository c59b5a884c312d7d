//! Broker collaborator interface.
//!
//! The pull consumer core never talks to a wire protocol directly. Everything
//! it needs from the broker goes through [`Broker`], which is implemented by
//! [`InMemoryBroker`](crate::InMemoryBroker) and, with the `nats` feature, by
//! `NatsBroker`.

use crate::config::{ConsumerConfig, StreamConfig};
use crate::error::PullResult;
use crate::fetch::{BatchRequest, BatchResult};
use crate::message::{AckHandle, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// A stream known to exist on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub name: String,
}

/// A consumer known to exist on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub stream: String,
    /// Broker-assigned name for ephemeral consumers.
    pub name: String,
    pub durable: bool,
    /// Ack wait the broker applies to this consumer's deliveries.
    pub ack_wait: Duration,
}

/// Broker confirmation of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Consumer progress as reported by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub durable: bool,
    /// Messages matching the filter that were never delivered.
    pub num_pending: u64,
    /// Delivered but not yet acknowledged.
    pub num_ack_pending: usize,
    /// Messages waiting to be delivered again.
    pub num_redelivered: usize,
    /// Fetch requests currently waiting.
    pub num_waiting: usize,
}

/// Stream state as reported by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Operations the consumer core needs from a broker connection.
///
/// Implementations must tolerate concurrent callers: many sessions may share
/// one broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a stream, or return the existing one with the same name.
    async fn create_stream(&self, config: StreamConfig) -> PullResult<StreamHandle>;

    /// Delete a stream and all its consumers.
    async fn delete_stream(&self, name: &str) -> PullResult<()>;

    /// Publish a payload. Used to seed data; not part of consumption.
    async fn publish(&self, subject: &str, payload: Bytes) -> PullResult<PublishAck>;

    /// Create a consumer, or bind to an existing durable one with that name.
    async fn create_or_bind_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> PullResult<ConsumerHandle>;

    /// Bind to an existing consumer by name without creating it.
    async fn bind_consumer(&self, stream: &str, name: &str) -> PullResult<ConsumerHandle>;

    /// Pull a batch of messages for `consumer`.
    async fn fetch(
        &self,
        consumer: &ConsumerHandle,
        request: BatchRequest,
    ) -> PullResult<BatchResult>;

    /// Acknowledge one delivery.
    async fn ack(&self, handle: &AckHandle, kind: AckKind) -> PullResult<()>;

    /// Consumer progress.
    async fn consumer_info(&self, consumer: &ConsumerHandle) -> PullResult<ConsumerInfo>;

    /// Stream state.
    async fn stream_info(&self, stream: &str) -> PullResult<StreamInfo>;

    /// Delete a consumer.
    async fn delete_consumer(&self, stream: &str, name: &str) -> PullResult<()>;
}

/// Match a subject against a filter with `*` (one token) and `>` (one or
/// more trailing tokens) wildcards.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether two filters can match a common subject.
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => {}
            (Some(x), Some(y)) if x == y => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

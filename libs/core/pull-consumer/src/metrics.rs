//! Prometheus metrics for pull consumer sessions.

use crate::error::{PullError, PullResult};
use crate::fetch::{BatchResult, FetchStatus};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Metrics for one consumer session.
#[derive(Clone, Debug)]
pub struct ConsumerMetrics {
    stream_name: String,
    consumer_name: String,
}

impl ConsumerMetrics {
    /// Create new metrics.
    pub fn new(stream_name: &str, consumer_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            consumer_name: consumer_name.to_string(),
        }
    }

    /// Record a completed fetch.
    pub fn fetch_completed(&self, batch: &BatchResult, duration: Duration) {
        counter!(
            "pull_consumer_messages_fetched_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(batch.len() as u64);

        histogram!(
            "pull_consumer_fetch_duration_seconds",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .record(duration.as_secs_f64());

        histogram!(
            "pull_consumer_batch_size",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .record(batch.len() as f64);

        if batch.status == FetchStatus::Timeout {
            counter!(
                "pull_consumer_fetch_timeouts_total",
                "stream" => self.stream_name.clone(),
                "consumer" => self.consumer_name.clone()
            )
            .increment(1);
        }
    }

    /// Record a fetch that failed with a hard error.
    pub fn fetch_failed(&self, error: &PullError) {
        counter!(
            "pull_consumer_fetch_errors_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone(),
            "category" => error.category().to_string()
        )
        .increment(1);
    }

    /// Record a settled message.
    pub fn message_settled(&self, outcome: &'static str) {
        counter!(
            "pull_consumer_messages_settled_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record an ack that the broker did not accept.
    pub fn ack_failed(&self) {
        counter!(
            "pull_consumer_ack_errors_total",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .increment(1);
    }

    /// Update the un-acked gauge.
    pub fn ack_pending(&self, pending: usize) {
        gauge!(
            "pull_consumer_ack_pending",
            "stream" => self.stream_name.clone(),
            "consumer" => self.consumer_name.clone()
        )
        .set(pending as f64);
    }
}

/// Install the Prometheus recorder.
pub fn init_metrics() -> PullResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PullError::Config(format!("failed to install Prometheus recorder: {}", e)))
}

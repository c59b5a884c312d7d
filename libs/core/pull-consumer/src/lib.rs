//! Pull consumer client core for JetStream-style brokers.
//!
//! The application asks the broker for bounded batches of messages, handles
//! them, and acknowledges each one. Anything left un-acked past the consumer's
//! ack wait is redelivered by the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  fetch(batch)   ┌─────────────────────┐
//! │ ConsumerSession  │────────────────▶│   dyn Broker        │
//! │  (fetch loop)    │◀────────────────│ (InMemory / NATS)   │
//! └──────────────────┘   BatchResult   └─────────────────────┘
//!          │                                     ▲
//!          ▼                                     │ ack / nak / term
//! ┌──────────────────┐                           │
//! │   AckTracker     │───────────────────────────┘
//! │ (pending state)  │
//! └──────────────────┘
//! ```
//!
//! A [`BalancedGroup`] binds several sessions to one durable consumer; the
//! broker makes sure each message goes to only one of them.
//!
//! # Key Features
//!
//! - **Bounded fetches**: count and payload-byte limits, expiring or no-wait
//! - **Explicit acks**: ack, double ack, nak with delay, term
//! - **Durable and ephemeral consumers**: ephemeral ones expire when idle
//! - **Prometheus metrics**: fetch latency, batch sizes, settle outcomes
//! - **Graceful drain**: wait for outstanding acks before closing
//!
//! # Example
//!
//! ```rust,ignore
//! use pull_consumer::{Broker, ConsumerSession, FetchPlan, InMemoryBroker, StreamConfig};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//! broker.create_stream(StreamConfig::new("EVENTS", ["event.>"])).await?;
//!
//! let session = ConsumerSession::open(broker, "EVENTS", None, Some("event-consumer")).await?;
//! let messages = session.messages(FetchPlan::new(2, 5));
//! futures::pin_mut!(messages);
//! while let Some(message) = messages.next().await {
//!     let message = message?;
//!     session.ack(&message).await?;
//! }
//! session.drain().await;
//! ```

mod ack;
mod broker;
mod config;
mod distributor;
mod error;
mod fetch;
mod handler;
mod memory;
mod message;
pub mod metrics;
#[cfg(feature = "nats")]
mod nats;
mod session;

pub use ack::{AckState, AckSummary, AckTracker};
pub use broker::{
    subject_matches, subjects_overlap, Broker, ConsumerHandle, ConsumerInfo, PublishAck,
    StreamHandle, StreamInfo,
};
pub use config::{
    ConsumerConfig, FetchPlan, RetentionPolicy, StreamConfig, StreamDef, DEFAULT_ACK_WAIT,
    DEFAULT_INACTIVE_THRESHOLD,
};
pub use distributor::{BalancedGroup, DistributionReport, DEFAULT_POLL_TIMEOUT};
pub use error::{ErrorCategory, PullError, PullResult};
pub use fetch::{Admission, BatchBudget, BatchRequest, BatchResult, FetchStatus, DEFAULT_FETCH_TIMEOUT};
pub use handler::{HandlerError, MessageHandler};
pub use memory::InMemoryBroker;
pub use message::{AckHandle, AckKind, DeliveryInfo, Message};
pub use metrics::{init_metrics, ConsumerMetrics};
#[cfg(feature = "nats")]
pub use nats::{NatsBroker, NatsConnectOptions};
pub use session::{ConsumeReport, ConsumerSession, DrainReport, SessionState, DEFAULT_DRAIN_TIMEOUT};

//! Local acknowledgment bookkeeping.
//!
//! The tracker remembers, per stream sequence, what this session did with the
//! last delivery it received. It never tries to prevent broker redelivery:
//! a message whose ack wait ran out is only *reported* as expired.

use crate::broker::Broker;
use crate::error::{PullError, PullResult};
use crate::fetch::deadline_after;
use crate::message::{AckKind, Message};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Local state of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Delivered, no ack sent yet.
    Pending,
    /// Acknowledged.
    Acked,
    /// Negatively acknowledged; the broker will redeliver.
    Nacked,
    /// Terminated; the broker will not redeliver.
    Terminated,
    /// Still pending after the ack wait elapsed; the broker may redeliver.
    Expired,
}

impl AckState {
    fn settled_by(kind: AckKind) -> Self {
        match kind {
            AckKind::Ack | AckKind::AckSync => AckState::Acked,
            AckKind::Nak(_) => AckState::Nacked,
            AckKind::Term => AckState::Terminated,
        }
    }
}

/// Counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSummary {
    pub pending: usize,
    pub acked: usize,
    pub nacked: usize,
    pub terminated: usize,
    pub expired: usize,
}

#[derive(Debug)]
struct Entry {
    delivery_count: u32,
    deadline: Instant,
    state: AckState,
}

/// Per-session ack state.
#[derive(Debug)]
pub struct AckTracker {
    ack_wait: Duration,
    entries: Mutex<HashMap<u64, Entry>>,
    settled: Notify,
}

impl AckTracker {
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            ack_wait,
            entries: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivery. A redelivery of a known sequence starts over as
    /// pending.
    pub fn track(&self, message: &Message) {
        let deadline = deadline_after(Instant::now(), self.ack_wait);
        self.entries().insert(
            message.sequence,
            Entry {
                delivery_count: message.info.delivery_count,
                deadline,
                state: AckState::Pending,
            },
        );
    }

    /// Current state of a sequence, if it was ever delivered to this session.
    pub fn state(&self, sequence: u64) -> Option<AckState> {
        let now = Instant::now();
        self.entries().get(&sequence).map(|entry| match entry.state {
            AckState::Pending if now >= entry.deadline => AckState::Expired,
            state => state,
        })
    }

    /// Send `kind` for `message` through `broker`.
    ///
    /// Acking an already acked delivery is a no-op. Any other second
    /// settlement is rejected. If the broker call fails the entry stays
    /// pending and the error is returned to the caller.
    pub async fn settle(&self, broker: &dyn Broker, message: &Message, kind: AckKind) -> PullResult<bool> {
        let sequence = message.sequence;
        {
            let entries = self.entries();
            match entries.get(&sequence) {
                None => {
                    return Err(PullError::ack(sequence, "message was not delivered to this session"));
                }
                Some(entry) if entry.delivery_count != message.info.delivery_count => {
                    return Err(PullError::ack(
                        sequence,
                        format!(
                            "stale delivery {} (current delivery is {})",
                            message.info.delivery_count, entry.delivery_count
                        ),
                    ));
                }
                Some(entry) => match (entry.state, kind) {
                    (AckState::Pending, _) | (AckState::Expired, _) => {}
                    (AckState::Acked, AckKind::Ack | AckKind::AckSync) => {
                        debug!(sequence, "Duplicate ack ignored");
                        return Ok(false);
                    }
                    (state, kind) => {
                        return Err(PullError::ack(
                            sequence,
                            format!("already settled as {:?}, cannot send {:?}", state, kind),
                        ));
                    }
                },
            }
        }

        if let Err(e) = broker.ack(&message.ack_handle(), kind).await {
            warn!(sequence, error = %e, "Ack not delivered, message stays pending");
            return Err(match e {
                PullError::Ack { .. } | PullError::ConsumerGone { .. } => e,
                other => PullError::ack(sequence, other.to_string()),
            });
        }

        if let Some(entry) = self.entries().get_mut(&sequence) {
            if entry.delivery_count == message.info.delivery_count {
                entry.state = AckState::settled_by(kind);
            }
        }
        self.settled.notify_waiters();
        Ok(true)
    }

    /// Deliveries still waiting for an ack within their ack wait.
    ///
    /// Expired deliveries are not counted: the broker already took them back
    /// and may have handed them to another session.
    pub fn pending_count(&self) -> usize {
        self.in_flight(Instant::now()).0
    }

    /// In-flight count and the earliest ack-wait deadline among them.
    fn in_flight(&self, now: Instant) -> (usize, Option<Instant>) {
        self.entries()
            .values()
            .filter(|entry| entry.state == AckState::Pending && now < entry.deadline)
            .fold((0, None), |(count, next), entry| {
                let next = Some(next.map_or(entry.deadline, |n: Instant| n.min(entry.deadline)));
                (count + 1, next)
            })
    }

    pub fn summary(&self) -> AckSummary {
        let now = Instant::now();
        let mut summary = AckSummary::default();
        for entry in self.entries().values() {
            match entry.state {
                AckState::Pending if now >= entry.deadline => summary.expired += 1,
                AckState::Pending => summary.pending += 1,
                AckState::Acked => summary.acked += 1,
                AckState::Nacked => summary.nacked += 1,
                AckState::Terminated => summary.terminated += 1,
                AckState::Expired => summary.expired += 1,
            }
        }
        summary
    }

    /// Wait until no delivery is in flight or `timeout` elapses. Returns the
    /// number still in flight.
    ///
    /// Deliveries whose ack wait runs out while waiting stop counting.
    pub async fn wait_settled(&self, timeout: Duration) -> usize {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (in_flight, next_expiry) = self.in_flight(now);
            if in_flight == 0 {
                return 0;
            }
            if now >= deadline {
                return in_flight;
            }
            let wake = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::message::test_message;

    fn accepting_broker() -> MockBroker {
        let mut broker = MockBroker::new();
        broker.expect_ack().returning(|_, _| Ok(()));
        broker
    }

    #[tokio::test]
    async fn test_double_ack_is_idempotent() {
        let mut broker = MockBroker::new();
        broker.expect_ack().times(1).returning(|_, _| Ok(()));

        let tracker = AckTracker::new(Duration::from_secs(30));
        let msg = test_message(1, "event.1", b"a");
        tracker.track(&msg);

        assert!(tracker.settle(&broker, &msg, AckKind::Ack).await.unwrap());
        let first = tracker.summary();
        assert!(!tracker.settle(&broker, &msg, AckKind::Ack).await.unwrap());
        assert_eq!(tracker.summary(), first);
        assert_eq!(tracker.state(1), Some(AckState::Acked));
    }

    #[tokio::test]
    async fn test_ack_after_nack_is_rejected() {
        let broker = accepting_broker();
        let tracker = AckTracker::new(Duration::from_secs(30));
        let msg = test_message(2, "event.2", b"b");
        tracker.track(&msg);

        tracker
            .settle(&broker, &msg, AckKind::Nak(None))
            .await
            .unwrap();
        let err = tracker.settle(&broker, &msg, AckKind::Ack).await.unwrap_err();
        assert!(matches!(err, PullError::Ack { sequence: 2, .. }));
        assert_eq!(tracker.state(2), Some(AckState::Nacked));
    }

    #[tokio::test]
    async fn test_failed_ack_leaves_message_pending() {
        let mut broker = MockBroker::new();
        broker
            .expect_ack()
            .times(1)
            .returning(|_, _| Err(PullError::Connection("broken pipe".to_string())));

        let tracker = AckTracker::new(Duration::from_secs(30));
        let msg = test_message(3, "event.3", b"c");
        tracker.track(&msg);

        let err = tracker.settle(&broker, &msg, AckKind::Ack).await.unwrap_err();
        assert!(matches!(err, PullError::Ack { sequence: 3, .. }));
        assert_eq!(tracker.state(3), Some(AckState::Pending));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_stale_deliveries_are_rejected() {
        let broker = accepting_broker();
        let tracker = AckTracker::new(Duration::from_secs(30));
        let msg = test_message(4, "event.4", b"d");

        assert!(tracker.settle(&broker, &msg, AckKind::Ack).await.is_err());

        let mut redelivered = msg.clone();
        redelivered.info.delivery_count = 2;
        tracker.track(&redelivered);
        assert!(tracker.settle(&broker, &msg, AckKind::Ack).await.is_err());
        assert!(tracker
            .settle(&broker, &redelivered, AckKind::Ack)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_message_reports_expired() {
        let tracker = AckTracker::new(Duration::from_secs(1));
        let msg = test_message(5, "event.5", b"e");
        tracker.track(&msg);
        assert_eq!(tracker.state(5), Some(AckState::Pending));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.state(5), Some(AckState::Expired));
        assert_eq!(tracker.summary().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_delivery_is_not_in_flight() {
        let tracker = AckTracker::new(Duration::from_secs(1));
        tracker.track(&test_message(7, "event.7", b"g"));
        tracker.track(&test_message(8, "event.8", b"h"));
        assert_eq!(tracker.pending_count(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.summary().expired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_settled_returns_when_ack_wait_runs_out() {
        let tracker = AckTracker::new(Duration::from_millis(300));
        tracker.track(&test_message(9, "event.9", b"i"));

        let start = Instant::now();
        assert_eq!(tracker.wait_settled(Duration::from_secs(5)).await, 0);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ack_wait_does_not_overflow() {
        let tracker = AckTracker::new(Duration::MAX);
        tracker.track(&test_message(10, "event.10", b"j"));
        assert_eq!(tracker.state(10), Some(AckState::Pending));
        assert_eq!(tracker.wait_settled(Duration::from_secs(1)).await, 1);

        let idle = AckTracker::new(Duration::from_secs(1));
        assert_eq!(idle.wait_settled(Duration::MAX).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_settled_times_out_with_pending_count() {
        let tracker = AckTracker::new(Duration::from_secs(30));
        tracker.track(&test_message(6, "event.6", b"f"));
        assert_eq!(tracker.wait_settled(Duration::from_millis(100)).await, 1);
    }
}

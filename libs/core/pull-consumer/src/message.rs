//! Messages delivered by a pull fetch.

use crate::error::PullResult;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Delivery metadata attached by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream the message was read from.
    pub stream: String,
    /// Consumer that delivered it.
    pub consumer: String,
    /// Number of times this sequence has been delivered (1 on first delivery).
    pub delivery_count: u32,
}

/// A message handed to the application by a fetch.
///
/// Immutable once delivered. Acknowledge it through the session that fetched
/// it so the local ack state stays in sync with the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Stream sequence number.
    pub sequence: u64,
    /// Delivery metadata.
    pub info: DeliveryInfo,
}

impl Message {
    /// Payload size used for byte-limited batching.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Check if this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.info.delivery_count > 1
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> PullResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Handle used to acknowledge this delivery.
    pub fn ack_handle(&self) -> AckHandle {
        AckHandle {
            stream: self.info.stream.clone(),
            consumer: self.info.consumer.clone(),
            sequence: self.sequence,
            delivery_count: self.info.delivery_count,
        }
    }
}

/// Identifies one delivery of one message to one consumer.
///
/// A redelivery of the same sequence carries a higher `delivery_count`, so an
/// ack that arrives after the broker already redelivered is recognised as
/// stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub stream: String,
    pub consumer: String,
    pub sequence: u64,
    pub delivery_count: u32,
}

/// Kind of acknowledgment sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; never redeliver.
    Ack,
    /// Processed; wait for the broker to confirm it recorded the ack.
    AckSync,
    /// Not processed; redeliver, optionally after a delay.
    Nak(Option<Duration>),
    /// Give up on this message; never redeliver.
    Term,
}

impl AckKind {
    /// Whether the broker should forget the message for good.
    pub fn is_final(&self) -> bool {
        matches!(self, AckKind::Ack | AckKind::AckSync | AckKind::Term)
    }
}

#[cfg(test)]
pub(crate) fn test_message(sequence: u64, subject: &str, payload: &'static [u8]) -> Message {
    Message {
        subject: subject.to_string(),
        payload: Bytes::from_static(payload),
        sequence,
        info: DeliveryInfo {
            stream: "EVENTS".to_string(),
            consumer: "event-consumer".to_string(),
            delivery_count: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: i64,
    }

    #[test]
    fn test_json_payload() {
        let msg = test_message(1, "event.1", br#"{"sensor":"t1","value":21}"#);
        let reading: Reading = msg.json().unwrap();
        assert_eq!(
            reading,
            Reading {
                sensor: "t1".to_string(),
                value: 21
            }
        );

        let bad = test_message(2, "event.2", b"not json");
        assert!(bad.json::<Reading>().is_err());
    }

    #[test]
    fn test_ack_handle_identifies_delivery() {
        let mut msg = test_message(7, "event.7", b"x");
        let first = msg.ack_handle();
        msg.info.delivery_count = 2;
        let second = msg.ack_handle();

        assert!(msg.is_redelivery());
        assert_eq!(first.sequence, second.sequence);
        assert_ne!(first, second);
    }
}

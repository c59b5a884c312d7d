//! Shared test utilities for the pull consumer crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic stream/consumer names and payloads (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_nats_test");
//!
//!     let stream = names.stream("EVENTS");
//!     let client = nats.client();
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test data with deterministic randomization
///
/// Tests sharing one server use it to avoid colliding stream and consumer
/// names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_balanced_pair");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name unique to this test, e.g. `EVENTS_1234`.
    pub fn stream(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.seed)
    }

    /// Subject prefix unique to this test, e.g. `event1234`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.seed)
    }

    /// Consumer name unique to this test.
    pub fn consumer(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seed)
    }

    /// Payload of `len` bytes cycling through the ASCII digits.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// assert_eq!(TestDataBuilder::payload(12), b"012345678901".to_vec());
    /// ```
    pub fn payload(len: usize) -> Vec<u8> {
        (b'0'..=b'9').cycle().take(len).collect()
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that a sequence list is strictly increasing
    pub fn assert_increasing(sequences: &[u64], context: &str) {
        for pair in sequences.windows(2) {
            assert!(
                pair[0] < pair[1],
                "{}: sequences out of order: {:?}",
                context,
                sequences
            );
        }
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.stream("EVENTS"), builder2.stream("EVENTS"));
        assert_eq!(builder1.stream("EVENTS"), "EVENTS_42");
        assert_eq!(builder1.consumer("processor"), "processor-42");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        // Different test names should generate different data
        assert_ne!(builder1.stream("EVENTS"), builder2.stream("EVENTS"));
    }

    #[test]
    fn test_payload_pattern() {
        let payload = TestDataBuilder::payload(50);
        assert_eq!(payload.len(), 50);
        assert_eq!(&payload[..10], b"0123456789");
        assert_eq!(payload[49], b'9');
    }

    #[test]
    fn test_assert_increasing() {
        assertions::assert_increasing(&[1, 2, 5], "ordered");
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_assert_increasing_panics() {
        assertions::assert_increasing(&[2, 1], "unordered");
    }
}

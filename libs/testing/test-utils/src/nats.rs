//! NATS test infrastructure
//!
//! `TestNats` starts a NATS container with JetStream for pull consumer tests.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Hand the client to the code under test
/// let client = nats.client();
///
/// // Or talk to JetStream directly to set up fixtures
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Start NATS with JetStream enabled (`-js`).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for fixture setup
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

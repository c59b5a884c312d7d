//! Pull Consumer Demo
//!
//! Runs the pull consumer walkthroughs once against the configured broker.
//!
//! ## Architecture
//!
//! ```text
//! DemoConfig (PULL_DEMO_*, NATS_*)
//!   ↓
//! Arc<dyn Broker>  (InMemoryBroker | NatsBroker)
//!   ↓
//! Scenarios
//!   ├─ fetch_in_batches      5 messages, batch 2 → [2, 2, 1, 0]
//!   ├─ byte_limited_fetch    ask 1000, capped by max bytes
//!   ├─ balanced_pair         two sessions, one durable consumer
//!   └─ delete_while_fetching fetch loop halts with ConsumerGone
//!   ↓
//! Endpoints  minmax.{min,max,average}
//! ```
//!
//! ## Configuration
//!
//! - `PULL_DEMO_BACKEND`: `memory` (default) or `nats` (needs the `nats` feature)
//! - `PULL_DEMO_STREAM`, `PULL_DEMO_SUBJECT`: naming
//! - `PULL_DEMO_MESSAGES`, `PULL_DEMO_BATCH`, `PULL_DEMO_PAYLOAD_BYTES`,
//!   `PULL_DEMO_MAX_BYTES`, `PULL_DEMO_FETCH_TIMEOUT_MS`: sizes and timing
//! - `NATS_*`: connection settings, see [`core_config::NatsConfig`]

pub mod config;
pub mod endpoints;
pub mod scenarios;

use crate::config::{Backend, DemoConfig};
use crate::endpoints::Endpoint;
use crate::scenarios::Scenarios;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use pull_consumer::{Broker, InMemoryBroker};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Inputs sent to every endpoint.
const SAMPLE_INPUTS: [&[i64]; 2] = [&[4, -2, 9, 1], &[]];

/// Run the demo
///
/// 1. Sets up color-eyre, tracing and the Prometheus recorder
/// 2. Loads `DemoConfig` and connects the selected broker
/// 3. Runs every scenario, stopping early on Ctrl+C or SIGTERM
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the broker cannot be
/// reached, or a scenario fails.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let _metrics = pull_consumer::init_metrics().wrap_err("Failed to install metrics recorder")?;

    let config = DemoConfig::from_env().wrap_err("Failed to load demo configuration")?;
    info!(backend = %config.backend, stream = %config.stream, "Starting pull consumer demo");

    tokio::select! {
        result = run_backend(config) => result,
        result = shutdown_signal() => {
            result?;
            info!("Demo interrupted");
            Ok(())
        }
    }
}

async fn run_backend(config: DemoConfig) -> Result<()> {
    match config.backend {
        Backend::Memory => {
            let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
            run_scenarios(broker, config).await?;
            call_endpoints_in_process();
            Ok(())
        }
        Backend::Nats => run_nats(config).await,
    }
}

async fn run_scenarios(broker: Arc<dyn Broker>, config: DemoConfig) -> Result<()> {
    let scenarios = Scenarios::new(broker, config);

    let sizes = scenarios.fetch_in_batches().await.wrap_err("Batch scenario failed")?;
    info!(?sizes, "Batch scenario done");

    let limited = scenarios
        .byte_limited_fetch()
        .await
        .wrap_err("Byte-limited scenario failed")?;
    info!(received = limited.received, bytes = limited.bytes, "Byte-limited scenario done");

    let balanced = scenarios.balanced_pair().await.wrap_err("Balanced scenario failed")?;
    info!(
        total = balanced.distribution.total(),
        per_session = ?balanced.distribution.per_session,
        "Balanced scenario done"
    );

    let seen = scenarios
        .delete_while_fetching()
        .await
        .wrap_err("Delete scenario failed")?;
    info!(seen, "Delete scenario done");

    Ok(())
}

fn call_endpoints_in_process() {
    for input in SAMPLE_INPUTS {
        for endpoint in Endpoint::ALL {
            match endpoint.apply(input) {
                Ok(output) => info!(%endpoint, ?input, ?output, "Endpoint answered"),
                Err(e) => error!(%endpoint, ?input, error = %e, "Endpoint rejected input"),
            }
        }
    }
}

#[cfg(feature = "nats")]
async fn run_nats(config: DemoConfig) -> Result<()> {
    use core_config::NatsCredentials;
    use pull_consumer::{NatsBroker, NatsConnectOptions};
    use tokio::sync::watch;

    let nats = config
        .nats
        .clone()
        .ok_or_else(|| eyre::eyre!("NATS backend selected without NATS settings"))?;

    let mut options = NatsConnectOptions::new(&nats.url);
    options.client_name = Some(nats.client_name.clone());
    options.connect_timeout = Some(nats.connect_timeout);
    match nats.credentials {
        NatsCredentials::None => {}
        NatsCredentials::UserPassword { user, password } => {
            options.user_and_password = Some((user, password))
        }
        NatsCredentials::Token(token) => options.token = Some(token),
        NatsCredentials::CredsFile(path) => options.credentials_file = Some(path),
    }

    info!(url = %nats.url, "Connecting to NATS...");
    let broker = Arc::new(
        NatsBroker::connect(&options)
            .await
            .wrap_err("Failed to connect to NATS")?,
    );
    let client = broker.client().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(endpoints::serve(client.clone(), shutdown_rx));

    run_scenarios(broker, config).await?;

    for input in SAMPLE_INPUTS {
        for endpoint in Endpoint::ALL {
            let reply = endpoints::request(&client, endpoint, input).await?;
            info!(%endpoint, ?input, ?reply, "Endpoint replied");
        }
    }

    let _ = shutdown_tx.send(true);
    server.await.wrap_err("Endpoint task panicked")??;
    Ok(())
}

#[cfg(not(feature = "nats"))]
async fn run_nats(_config: DemoConfig) -> Result<()> {
    Err(eyre::eyre!(
        "PULL_DEMO_BACKEND=nats needs the binary built with --features nats"
    ))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

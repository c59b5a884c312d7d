//! Pull Consumer Demo - Entry Point
//!
//! Runs the fetch, balancing and endpoint scenarios once and exits.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jetstream_pull_demo::run().await
}

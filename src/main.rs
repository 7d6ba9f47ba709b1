//! tias-harvest - Treaties and Other International Acts Series harvester.
//!
//! Walks the State Department's yearly TIAS listings, collects agreement
//! detail links, then fetches each one and extracts its PDF or HTML content.

mod catalog;
mod cli;
mod config;
mod error;
mod extract;
mod pipeline;
mod scrapers;
mod sink;
mod storage;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "tias_harvest=info"
    } else {
        "tias_harvest=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}

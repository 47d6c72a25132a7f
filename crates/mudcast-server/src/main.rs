//! # mudcast server
//!
//! Channel chat and presence watching for multiplayer text games, served
//! over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! mudcast
//!
//! # Run with a specific config file
//! MUDCAST_CONFIG=/path/to/mudcast.toml mudcast
//!
//! # Override the bind address
//! MUDCAST_PORT=4000 MUDCAST_HOST=0.0.0.0 mudcast
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mudcast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        channels = config.channels.len(),
        "Starting mudcast on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

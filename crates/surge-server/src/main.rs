//! # Surge Server
//!
//! Real-time push/pub-sub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! surge
//!
//! # Run with a config file in the search path
//! cp surge.toml /etc/surge/surge.toml && surge
//!
//! # Run with environment variables
//! SURGE_PORT=8080 SURGE_HOST=0.0.0.0 surge
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "surge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Surge server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

//! # roomcast
//!
//! Real-time room server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings, single process, in-memory state
//! roomcast
//!
//! # Share state between processes
//! ROOMCAST__REDIS__URL=redis://127.0.0.1/ \
//! ROOMCAST__DATABASE__URL=postgres://localhost/roomcast roomcast
//! ```

use anyhow::Result;
use roomcast_server::config::{Config, LogFormat};
use roomcast_server::metrics;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "roomcast=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting roomcast on {}:{}", config.host, config.port);

    metrics::init_metrics();

    roomcast_server::run(config).await
}

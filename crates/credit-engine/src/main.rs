//! Credit Engine - daily grant worker
//!
//! Opens the configured storage backend and runs the daily subscription
//! grant loop until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credit_core::SystemClock;
use credit_engine::{Backend, Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Credit Engine");

    // Load configuration from environment
    let config = EngineConfig::from_env();

    tracing::info!(
        backend = ?config.backend,
        data_dir = %config.data_dir,
        default_balance = %config.default_balance,
        exchange_rate = %config.exchange_rate,
        grant_hour = config.grant_hour,
        grant_utc_offset = %config.grant_utc_offset,
        retention_days = ?config.ledger_retention_days,
        "Engine configuration loaded"
    );

    let backend = Backend::open(&config).await?;
    let engine = Engine::new(&config, backend, Arc::new(SystemClock))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = engine.spawn_scheduler(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown_tx.send(true)?;
    scheduler.await?;

    tracing::info!("Credit Engine stopped");
    Ok(())
}

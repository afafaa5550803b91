//! Vibe Media - headless download service with a REST and WebSocket API

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibe_media::config;
use vibe_media::db::Database;
use vibe_media::{server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Vibe Media v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = config::config_path();
    let settings = config::load_or_create_at(&config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    // Initialize database
    let db = Database::new()?;
    info!("Database initialized");

    // Create shared application state
    let state = Arc::new(AppState::new(settings, config_path, db)?);

    // Interrupted downloads come back paused; pending ones are queued again
    state.download_manager.recover()?;

    if let Err(e) = server::run(Arc::clone(&state), shutdown_signal()).await {
        error!("Server error: {}", e);
    }

    state.download_manager.shutdown().await;
    info!("Goodbye");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

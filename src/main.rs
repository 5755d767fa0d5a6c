//! probetrail - probe report collector.

use probetrail::config::ServerConfig;
use probetrail::db::Store;
use probetrail::scheduler::Scheduler;
use probetrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("probetrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting probetrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database; schema failures are fatal
    let store = Arc::new(Store::open(&cfg.db_path, cfg.read_connections)?);
    tracing::info!("Database initialized successfully");

    // Start ingest writer and retention sweeper
    let scheduler = Scheduler::start(store.clone(), &cfg);

    // Serve until ctrl-c
    let server = Server::new(cfg, store, scheduler.ingest());
    server.start(shutdown_signal()).await?;

    scheduler.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received");
    }
}

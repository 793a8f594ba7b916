//! Authoritative sync server.
//!
//! Usage: schedule-sync-server [CONFIG_DIR]
//!
//! Reads `config.json` from CONFIG_DIR (or the platform config directory
//! with the `desktop` feature), opens the configured database and serves
//! until Ctrl-C. Log level comes from RUST_LOG (default `info`).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use schedule_core::sync_server::start_server;
use schedule_core::{Config, Database, ScheduleResult, SyncService};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> ScheduleResult<()> {
    let config = Config::new(std::env::args().nth(1).map(PathBuf::from))?;
    tracing::info!("Using database {}", config.database_file());

    let db = Database::new(config.database_file())?;
    let service = SyncService::new(Arc::new(Mutex::new(db)))?.with_lock_timeout(config.lock_timeout());

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        let _ = tx.send(());
    });

    start_server(
        Arc::new(service),
        config.sync_server_port(),
        config.lock_sweep_interval(),
        rx,
    )
    .await
}

//! # Headless Sync Worker
//!
//! Runs the background worker without a UI: probes the backend, drains the
//! offline queue when it comes back, refreshes stock on a timer and keeps the
//! catalog cache warm.
//!
//! ## Usage
//! ```bash
//! cargo run -p tally-sync --bin tally-worker
//! cargo run -p tally-sync --bin tally-worker -- --config ./tally.toml
//! RUST_LOG=tally=trace cargo run -p tally-sync --bin tally-worker
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tally_db::{Database, DbConfig};
use tally_sync::{
    CatalogLoader, HttpBackend, PosBackend, StockReconciler, SyncConfig, SyncWorker, WorkerEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally POS Sync Worker");
                println!();
                println!("Usage: tally-worker [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Config file (default: platform config dir)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let config = Arc::new(SyncConfig::load_or_default(config_path));
    info!(
        backend = %config.backend.base_url,
        profile = ?config.pos_profile(),
        warehouse = ?config.warehouse(),
        "Starting sync worker"
    );

    let db_path = config.database_path();
    let (db, outcome) = Database::open_with_recovery(DbConfig::new(&db_path)).await?;
    info!(path = %db_path.display(), ?outcome, "Cache database ready");

    let backend: Arc<dyn PosBackend> = Arc::new(HttpBackend::new(&config)?);
    let (worker, handle) = SyncWorker::new(config.clone(), db.clone(), backend.clone());

    let reconciler = StockReconciler::from_config(backend.clone(), &config).with_worker(handle.clone());
    let cached = db.items().count().await?;
    let items = db.items().list(0, cached.max(0) as u32).await?;
    let tracked = reconciler.init(&items);
    debug!(tracked, "Stock ledger seeded from cache");

    let mut events = handle.subscribe();
    let task = worker.with_reconciler(reconciler).start();

    let loader = CatalogLoader::new(handle.clone(), backend, config.clone());
    let mut preload = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WorkerEvent::Ready { server_online }) => {
                    info!(server_online, "Worker ready");
                    if let Some(profile) = config.pos_profile() {
                        if server_online {
                            preload = loader.preload(profile).await.unwrap_or_else(|e| {
                                warn!(error = %e, "Catalog preload failed");
                                None
                            });
                        }
                    }
                }
                Ok(WorkerEvent::ServerStatusChanged { server_online }) => {
                    info!(server_online, "Server status changed");
                }
                Ok(WorkerEvent::QueueDrained { success, failed }) => {
                    info!(success, failed, "Offline queue drained");
                }
                Ok(WorkerEvent::CatalogProgress { cached, batches }) => {
                    debug!(cached, batches, "Catalog paging");
                }
                Ok(WorkerEvent::CatalogComplete { total }) => {
                    info!(total, "Catalog cached");
                }
                Ok(WorkerEvent::StockApplied { count }) => {
                    debug!(count, "Stock applied");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    if let Some(paging) = preload {
        paging.abort();
    }
    handle.shutdown().await?;
    task.await?;

    let pending = db.invoice_queue().count_unsynced().await.unwrap_or(0);
    info!(pending, "Sync worker stopped");
    db.close().await;
    Ok(())
}

// src/server/mod.rs

//! Runs a chunk store as a long-lived process: builds the object storage and the
//! store from the configuration, serves metrics, and shuts down on Ctrl-C.

use crate::config::{Config, StorageKind};
use crate::core::object::{FileStorage, MemStorage, ObjectStorage};
use crate::core::store::{CachedStore, ChunkStore};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

mod metrics_server;

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Builds the object storage selected by `config.storage`.
pub fn open_storage(config: &Config) -> Result<Arc<dyn ObjectStorage>> {
    Ok(match config.storage.kind {
        StorageKind::Memory => Arc::new(MemStorage::new()),
        StorageKind::File => Arc::new(FileStorage::new(&config.storage.path)?),
    })
}

/// The main startup function. Returns after a shutdown signal once background
/// tasks have been told to stop.
pub async fn run(
    config: Config,
    config_path: String,
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    let storage = open_storage(&config)?;
    let store = CachedStore::new(storage, config.chunk.clone())?;
    let (shutdown_tx, _) = broadcast::channel(1);

    if config.metrics.enabled {
        tokio::spawn(metrics_server::run_metrics_server(
            store.clone(),
            config.metrics.port,
            shutdown_tx.subscribe(),
        ));
    }

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = hangup() => reload_log_level(&config_path, &log_reload_handle),
        }
    }

    info!("Shutdown signal received, stopping background tasks.");
    let pending = store.pending_uploads();
    if pending > 0 {
        warn!(
            "{} staged blocks are not uploaded yet; they will be picked up on the next start",
            pending
        );
    }
    store.shutdown();
    let _ = shutdown_tx.send(());
    Ok(())
}

/// Re-reads `log_level` from the configuration file.
fn reload_log_level(config_path: &str, handle: &LogReloadHandle) {
    let level = match Config::from_file(config_path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("Keep the current log level, reloading the config failed: {:#}", e);
            return;
        }
    };
    match EnvFilter::try_new(&level) {
        Ok(filter) => match handle.reload(filter) {
            Ok(()) => info!("Log level set to '{}'", level),
            Err(e) => warn!("Failed to apply log level '{}': {}", level, e),
        },
        Err(e) => warn!("Invalid log level '{}': {}", level, e),
    }
}

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::hangup()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await
}

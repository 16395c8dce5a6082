// src/core/tasks/cache_scanner.rs

//! Rebuilds the index of a cache directory from what is on disk.

use crate::core::cache::DiskCacheShard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Scans the cached blocks of a shard at startup and then every `interval`.
/// Blocks left in the staging directory by a previous run are handed to the
/// uploader once, after the first scan.
pub struct CacheScannerTask {
    shard: Arc<DiskCacheShard>,
    interval: Duration,
}

impl CacheScannerTask {
    pub fn new(shard: Arc<DiskCacheShard>, interval: Duration) -> Self {
        Self { shard, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        let mut first = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.shard.scan_cached().await;
                    if first {
                        first = false;
                        self.shard.scan_staging().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cache scanner for {} shutting down.", self.shard.dir().display());
                    return;
                }
            }
        }
    }
}

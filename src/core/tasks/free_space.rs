// src/core/tasks/free_space.rs

//! Watches the free space of a cache device.

use crate::core::cache::DiskCacheShard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Periodically re-evaluates free bytes and inodes of one cache directory,
/// evicting blocks or pushing staged blocks out when space runs low.
pub struct FreeSpaceTask {
    shard: Arc<DiskCacheShard>,
    interval: Duration,
}

impl FreeSpaceTask {
    pub fn new(shard: Arc<DiskCacheShard>, interval: Duration) -> Self {
        Self { shard, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let shard = self.shard.clone();
                    // statvfs and file removal block.
                    if let Err(e) = tokio::task::spawn_blocking(move || shard.check_free_space()).await {
                        debug!("free space check of {} failed: {}", self.shard.dir().display(), e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Free space checker for {} shutting down.", self.shard.dir().display());
                    return;
                }
            }
        }
    }
}

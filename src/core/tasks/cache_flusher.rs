// src/core/tasks/cache_flusher.rs

//! Drains the write queue of a disk cache shard.

use crate::core::cache::DiskCacheShard;
use crate::core::cache::disk::PendingPage;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Writes queued blocks to their cache directory, one at a time.
pub struct CacheFlusherTask {
    shard: Arc<DiskCacheShard>,
    pending_rx: mpsc::Receiver<PendingPage>,
}

impl CacheFlusherTask {
    pub fn new(shard: Arc<DiskCacheShard>, pending_rx: mpsc::Receiver<PendingPage>) -> Self {
        Self { shard, pending_rx }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!("Cache flusher for {} started.", self.shard.dir().display());
        loop {
            tokio::select! {
                item = self.pending_rx.recv() => match item {
                    Some((key, page)) => self.shard.flush_pending(key, page).await,
                    None => return,
                },
                _ = shutdown_rx.recv() => {
                    debug!("Cache flusher for {} shutting down.", self.shard.dir().display());
                    return;
                }
            }
        }
    }
}

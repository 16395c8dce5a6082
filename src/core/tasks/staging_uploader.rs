// src/core/tasks/staging_uploader.rs

//! Uploads staged blocks once their upload delay has passed.

use crate::core::store::StoreInner;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Hands due staged blocks to the uploader, on every `staging_scan_interval` tick
/// and whenever a block is registered for immediate upload.
pub struct StagingUploaderTask {
    store: Arc<StoreInner>,
}

impl StagingUploaderTask {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self { store }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let pending = self.store.pending().clone();
        let mut interval = tokio::time::interval(self.store.config().staging_scan_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = pending.woken() => {}
                _ = shutdown_rx.recv() => {
                    debug!("Staging uploader shutting down.");
                    return;
                }
            }
            let started = self.store.upload_due();
            if started > 0 {
                debug!("Started uploading {} staged blocks", started);
            }
        }
    }
}

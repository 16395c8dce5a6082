// src/core/store/upload.rs

//! Delayed uploads of staged blocks.

use super::StoreInner;
use crate::core::buffer::Page;
use crate::core::cache::BlockKey;
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::metrics::STAGING_BLOCK_DELAY;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

struct PendingEntry {
    path: PathBuf,
    added: Instant,
    uploading: bool,
    force: bool,
}

/// Staged blocks that are not in the object storage yet.
pub struct PendingUploads {
    entries: Mutex<HashMap<BlockKey, PendingEntry>>,
    notify: Notify,
}

impl Default for PendingUploads {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingUploads {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Registers a staged block. `force` makes it due regardless of the upload
    /// delay; an entry already registered keeps its age.
    pub fn add(&self, key: BlockKey, path: PathBuf, force: bool) {
        let mut entries = self.entries.lock();
        entries
            .entry(key)
            .and_modify(|e| e.force |= force)
            .or_insert_with(|| PendingEntry {
                path,
                added: Instant::now(),
                uploading: false,
                force,
            });
    }

    /// Registers a block whose upload starts right away.
    fn start(&self, key: BlockKey, path: PathBuf) {
        self.entries.lock().insert(
            key,
            PendingEntry {
                path,
                added: Instant::now(),
                uploading: true,
                force: false,
            },
        );
    }

    /// Wakes the staging uploader.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.notify.notified().await
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets a block; returns when it was registered.
    pub fn remove(&self, key: &BlockKey) -> Option<Instant> {
        self.entries.lock().remove(key).map(|e| e.added)
    }

    /// Puts a block back in line after a failed upload.
    fn failed(&self, key: &BlockKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.uploading = false;
            entry.added = Instant::now();
        }
    }

    /// Claims the blocks that are forced or older than `delay`.
    fn take_due(&self, delay: Duration) -> Vec<(BlockKey, PathBuf)> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|(_, e)| !e.uploading && (e.force || e.added.elapsed() >= delay))
            .map(|(key, e)| {
                e.uploading = true;
                (*key, e.path.clone())
            })
            .collect()
    }
}

impl StoreInner {
    /// Follows a successful stage: uploads the block at once when nothing delays
    /// it, otherwise leaves it to the staging uploader.
    pub(super) async fn upload_staged_block(
        self: &Arc<Self>,
        key: BlockKey,
        block: Page,
        path: PathBuf,
    ) {
        if self.config.upload_delay.is_zero() && self.upload_permits.available_permits() > 0 {
            self.pending.start(key, path.clone());
            self.upload_staged(key, path, Some(block)).await;
        } else {
            drop(block);
            self.pending.add(key, path, false);
            if self.config.upload_delay.is_zero() {
                self.pending.wake();
            }
        }
    }

    /// Starts uploads for every due block. Returns how many were started.
    pub(crate) fn upload_due(self: &Arc<Self>) -> usize {
        let due = self.pending.take_due(self.config.upload_delay);
        let n = due.len();
        for (key, path) in due {
            let store = self.clone();
            tokio::spawn(async move { store.upload_staged(key, path, None).await });
        }
        n
    }

    async fn upload_staged(&self, key: BlockKey, path: PathBuf, block: Option<Page>) {
        let Ok(_permit) = self.upload_permits.acquire().await else {
            return;
        };
        if !self.pending.contains(&key) {
            debug!("Block {} is not needed, drop it", key);
            return;
        }
        let data = match block {
            Some(block) => self.compress(block.as_slice()),
            None => match read_staged(&key, &path).await {
                Ok(raw) => self.compress(&raw),
                Err(ChunkStoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Staged block {} is gone, skip it", key);
                    self.pending.remove(&key);
                    return;
                }
                Err(e) => Err(e),
            },
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                warn!("read staged block {}: {}", key, e);
                self.pending.failed(&key);
                return;
            }
        };

        let name = self.object_name(&key);
        let mut tried = 0u64;
        while let Err(e) = self.put(&name, data.clone()).await {
            tried += 1;
            if !self.pending.contains(&key) {
                return;
            }
            if tried > self.config.max_retries as u64 {
                warn!(
                    "upload staged block {} failed after {} tries: {}, will retry later",
                    name, tried, e
                );
                self.pending.failed(&key);
                return;
            }
            warn!("upload {}: {} (try {})", name, e, tried);
            tokio::time::sleep(Duration::from_secs(tried * tried)).await;
        }

        let Some(added) = self.pending.remove(&key) else {
            // Removed while the upload was in flight; its delete may have run first.
            debug!("Block {} was removed during upload, delete {}", key, name);
            match self.delete(&name).await {
                Ok(()) | Err(ChunkStoreError::ObjectNotFound(_)) => {}
                Err(e) => warn!("delete {} after removal: {}", name, e),
            }
            return;
        };
        STAGING_BLOCK_DELAY.observe(added.elapsed().as_secs_f64());
        self.bcache.uploaded(&key, key.len());
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("remove staged block {}: {}", path.display(), e);
        }
    }
}

/// Reads a staged block without its checksum trailer.
async fn read_staged(key: &BlockKey, path: &Path) -> Result<Vec<u8>> {
    let mut data = tokio::fs::read(path).await?;
    if data.len() < key.len() {
        return Err(ChunkStoreError::LengthMismatch {
            expected: key.len(),
            actual: data.len(),
        });
    }
    data.truncate(key.len());
    Ok(data)
}

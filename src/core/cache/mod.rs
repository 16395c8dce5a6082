// src/core/cache/mod.rs

//! The local block cache: memory or one shard per cache directory, behind a
//! single [`CacheManager`] interface.

pub mod disk;
pub mod eviction;
pub mod health;
mod key;
pub mod manager;
pub mod memory;
mod usage;

pub use disk::DiskCacheShard;
pub use health::{DiskHealth, DiskProbe, DiskState, HealthEvent, OpGuard};
pub use key::{BlockKey, parse_size};
pub use manager::{DiskCacheManager, new_cache_manager};
pub use memory::MemCache;

use crate::core::buffer::Page;
use crate::core::checksum::CacheFile;
use crate::core::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Hands a staged block to the store for upload: `(key, staging path, force)`.
/// `force` asks for an immediate upload regardless of any configured delay.
pub type Uploader = Arc<dyn Fn(BlockKey, PathBuf, bool) + Send + Sync>;

/// A cached block opened for reading.
#[derive(Debug)]
pub enum CacheReader {
    /// Still in memory, waiting to be written to disk (or in the memory cache).
    Page(Page),
    File(Arc<CacheFile>),
}

impl CacheReader {
    pub fn len(&self) -> usize {
        match self {
            CacheReader::Page(p) => p.len(),
            CacheReader::File(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` from offset `off` of the block and returns the bytes read.
    pub async fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        match self {
            CacheReader::Page(p) => Ok(p.read_at(buf, off)),
            CacheReader::File(f) => {
                let file = f.clone();
                let len = buf.len().min(file.len().saturating_sub(off));
                let data = tokio::task::spawn_blocking(move || {
                    let mut data = vec![0u8; len];
                    let n = file.read_at(&mut data, off)?;
                    data.truncate(n);
                    Ok::<_, crate::core::errors::ChunkStoreError>(data)
                })
                .await??;
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }
}

/// The block cache as seen by the chunk store.
#[async_trait]
pub trait CacheManager: Send + Sync {
    /// Queues `page` to be cached under `key`. Without `force` the block is dropped
    /// when the write queue is full; with it the call waits for room.
    async fn cache(&self, key: &BlockKey, page: Page, force: bool);

    async fn load(&self, key: &BlockKey) -> Result<CacheReader>;

    /// Removes the cached copy of `key`, and its staged copy too when `staging`.
    async fn remove(&self, key: &BlockKey, staging: bool);

    /// Writes a write-back block to the staging area and returns its path. With
    /// `keep_cache` the staged file is also readable as a cached block.
    async fn stage(&self, key: &BlockKey, data: &[u8], keep_cache: bool) -> Result<PathBuf>;

    /// Marks a staged block as uploaded; it becomes an ordinary cached block.
    fn uploaded(&self, key: &BlockKey, size: usize);

    fn stage_path(&self, key: &BlockKey) -> PathBuf;

    /// Whether `key` is cached, without touching its access time.
    fn exists(&self, key: &BlockKey) -> bool;

    /// `(blocks, bytes)` across all shards.
    fn stats(&self) -> (i64, i64);

    /// Bytes of blocks held in memory while waiting to be written.
    fn used_memory(&self) -> i64;

    fn shard_count(&self) -> usize;
}

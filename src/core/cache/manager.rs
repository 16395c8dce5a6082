// src/core/cache/manager.rs

//! Builds the block cache from `cache_dir` and routes blocks to its shards.

use super::disk::DiskCacheShard;
use super::memory::MemCache;
use super::{BlockKey, CacheManager, CacheReader, Uploader};
use crate::config::ChunkConfig;
use crate::core::buffer::Page;
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::tasks::cache_flusher::CacheFlusherTask;
use crate::core::tasks::cache_scanner::CacheScannerTask;
use crate::core::tasks::free_space::FreeSpaceTask;
use async_trait::async_trait;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use wildmatch::WildMatch;

/// Creates the cache described by `config`: a [`MemCache`] for `cache_dir =
/// "memory"` (or a zero `cache_size`), otherwise one shard per directory. Falls
/// back to memory when no directory is usable.
pub fn new_cache_manager(
    config: &ChunkConfig,
    uploader: Option<Uploader>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Arc<dyn CacheManager> {
    if config.cache_dir == "memory" || config.cache_size == 0 {
        return Arc::new(MemCache::new(config));
    }
    match DiskCacheManager::new(config, uploader, shutdown_tx) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            warn!("{}, use memory cache instead", e);
            Arc::new(MemCache::new(config))
        }
    }
}

/// Disk shards selected by a hash of the block name.
pub struct DiskCacheManager {
    shards: Vec<Arc<DiskCacheShard>>,
}

impl DiskCacheManager {
    /// Opens every directory of `config.cache_dir` and starts their background
    /// tasks, which stop on `shutdown_tx`.
    pub fn new(
        config: &ChunkConfig,
        uploader: Option<Uploader>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<Self> {
        let mut dirs = expand_dirs(&config.cache_dir);
        if !config.auto_create {
            dirs.retain(|dir| {
                let exists = dir.is_dir();
                if !exists {
                    warn!("cache dir {} does not exist, skip it", dir.display());
                }
                exists
            });
        }
        if dirs.is_empty() {
            return Err(ChunkStoreError::InvalidArgument(format!(
                "no usable cache directory in '{}'",
                config.cache_dir
            )));
        }

        let n = dirs.len();
        let capacity = config.cache_size as i64 / n as i64;
        let pending_pages = (config.buffer_size * 2 / 10 / config.block_size.max(1) / n).max(1);
        let mut shards = Vec::with_capacity(n);
        for dir in dirs {
            match DiskCacheShard::new(dir.clone(), capacity, pending_pages, config, uploader.clone())
            {
                Ok((shard, pending_rx)) => {
                    tokio::spawn(
                        CacheFlusherTask::new(shard.clone(), pending_rx)
                            .run(shutdown_tx.subscribe()),
                    );
                    tokio::spawn(
                        FreeSpaceTask::new(shard.clone(), config.free_space_check_interval)
                            .run(shutdown_tx.subscribe()),
                    );
                    tokio::spawn(
                        CacheScannerTask::new(shard.clone(), config.cache_scan_interval)
                            .run(shutdown_tx.subscribe()),
                    );
                    shards.push(shard);
                }
                Err(e) => warn!("skip cache dir {}: {}", dir.display(), e),
            }
        }
        if shards.is_empty() {
            return Err(ChunkStoreError::InvalidArgument(format!(
                "none of the cache directories in '{}' could be opened",
                config.cache_dir
            )));
        }
        info!("Block cache spread over {} cache directories", shards.len());
        Ok(Self { shards })
    }

    pub fn shards(&self) -> &[Arc<DiskCacheShard>] {
        &self.shards
    }

    /// The shard responsible for `key`. Stable for a given set of directories.
    pub fn shard_for(&self, key: &BlockKey) -> &Arc<DiskCacheShard> {
        let name = key.name(false);
        let hash = murmur3::murmur3_32(&mut Cursor::new(name.as_bytes()), 0).unwrap_or(0);
        &self.shards[hash as usize % self.shards.len()]
    }
}

#[async_trait]
impl CacheManager for DiskCacheManager {
    async fn cache(&self, key: &BlockKey, page: Page, force: bool) {
        self.shard_for(key).cache(key, page, force).await
    }

    async fn load(&self, key: &BlockKey) -> Result<CacheReader> {
        self.shard_for(key).load(key).await
    }

    async fn remove(&self, key: &BlockKey, staging: bool) {
        self.shard_for(key).remove(key, staging).await
    }

    async fn stage(&self, key: &BlockKey, data: &[u8], keep_cache: bool) -> Result<PathBuf> {
        self.shard_for(key).stage(key, data, keep_cache).await
    }

    fn uploaded(&self, key: &BlockKey, size: usize) {
        self.shard_for(key).uploaded(key, size)
    }

    fn stage_path(&self, key: &BlockKey) -> PathBuf {
        self.shard_for(key).stage_path(key)
    }

    fn exists(&self, key: &BlockKey) -> bool {
        self.shard_for(key).exists(key)
    }

    fn stats(&self) -> (i64, i64) {
        self.shards.iter().fold((0, 0), |(count, bytes), shard| {
            let (c, b) = shard.stats();
            (count + c, bytes + b)
        })
    }

    fn used_memory(&self) -> i64 {
        self.shards.iter().map(|s| s.used_memory()).sum()
    }

    fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Splits a `:`-separated directory list, expanding `~` and wildcards. The result
/// is sorted and free of duplicates.
pub fn expand_dirs(cache_dir: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = cache_dir
        .split(':')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .flat_map(|d| expand_pattern(&expand_home(d)))
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

fn expand_home(dir: &str) -> String {
    if (dir == "~" || dir.starts_with("~/"))
        && let Ok(home) = std::env::var("HOME")
    {
        return format!("{}{}", home, &dir[1..]);
    }
    dir.to_string()
}

fn has_meta(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Expands wildcard components of `pattern` against existing directories.
fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    let pattern = pattern.trim_end_matches('/');
    if pattern.is_empty() {
        return vec![PathBuf::from("/")];
    }
    if !has_meta(pattern) {
        return vec![PathBuf::from(pattern)];
    }
    let mut current = vec![if pattern.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    }];
    for part in pattern.split('/').filter(|p| !p.is_empty()) {
        if !has_meta(part) {
            for path in current.iter_mut() {
                path.push(part);
            }
            continue;
        }
        let matcher = WildMatch::new(part);
        current = current
            .iter()
            .flat_map(|base| matching_children(base, &matcher))
            .collect();
    }
    current
}

fn matching_children(base: &Path, matcher: &WildMatch) -> Vec<PathBuf> {
    let listing = if base.as_os_str().is_empty() {
        Path::new(".")
    } else {
        base
    };
    let Ok(entries) = std::fs::read_dir(listing) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|e| e.file_name().to_str().is_some_and(|n| matcher.matches(n)))
        .map(|e| base.join(e.file_name()))
        .collect();
    out.sort();
    out
}

// src/core/store/mod.rs

//! The chunked store: splits chunks into blocks, moves blocks between the object
//! storage and the local cache, and uploads written blocks.

mod reader;
mod upload;
mod writer;

pub use reader::ChunkReader;
pub use upload::PendingUploads;
pub use writer::ChunkWriter;

use crate::config::ChunkConfig;
use crate::core::buffer::{Page, PageMut, PagePool};
use crate::core::cache::{BlockKey, CacheManager, Uploader, new_cache_manager};
use crate::core::compress::{Compressor, new_compressor};
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::limiter::RateLimiter;
use crate::core::metrics::{OBJECT_DATA_BYTES, OBJECT_REQ_ERRORS, OBJECT_REQ_HIST};
use crate::core::object::ObjectStorage;
use crate::core::prefetch::{FetchFn, Prefetcher};
use crate::core::singleflight::Controller;
use crate::core::tasks::staging_uploader::StagingUploaderTask;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum length of a chunk.
pub const CHUNK_SIZE: usize = 64 << 20;
/// Write granularity of the first block of a chunk.
pub const PAGE_SIZE: usize = 64 << 10;
/// Object requests slower than this are logged at `info`.
pub const SLOW_REQUEST: Duration = Duration::from_secs(10);

/// First-block pages kept around for reuse by writers.
const PAGE_POOL_CAPACITY: usize = 128;
/// Upper bound of idle block buffers, further limited by `buffer_size`.
const BLOCK_POOL_CAPACITY: usize = 16;
const PREFETCH_QUEUE: usize = 10;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    fn new_reader(&self, id: u64, length: usize) -> ChunkReader;
    fn new_writer(&self, id: u64) -> ChunkWriter;
    /// Deletes every block of a chunk from the cache, the staging area and the
    /// object storage. Fails with `ChunkNotFound` when no block could be deleted.
    async fn remove(&self, id: u64, length: usize) -> Result<()>;
    /// Loads every block of a chunk into the cache.
    async fn fill_cache(&self, id: u64, length: usize) -> Result<()>;
    /// Drops the cached blocks of a chunk.
    async fn evict_cache(&self, id: u64, length: usize) -> Result<()>;
    /// Bytes of a chunk that are not cached.
    async fn check_cache(&self, id: u64, length: usize) -> Result<u64>;
    fn used_memory(&self) -> i64;
    /// Stops all background tasks.
    fn shutdown(&self);
}

/// A [`ChunkStore`] in front of an [`ObjectStorage`], with a local block cache.
#[derive(Clone)]
pub struct CachedStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    storage: Arc<dyn ObjectStorage>,
    bcache: Arc<dyn CacheManager>,
    config: ChunkConfig,
    compressor: Box<dyn Compressor>,
    seekable: bool,
    group: Controller<Page>,
    fetcher: Prefetcher,
    upload_permits: Semaphore,
    delete_permits: Semaphore,
    pending: Arc<PendingUploads>,
    page_pool: Arc<PagePool>,
    block_pool: Arc<PagePool>,
    upload_limit: Option<RateLimiter>,
    download_limit: Option<RateLimiter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CachedStore {
    /// Builds the store and starts its background tasks. Must be called within a
    /// tokio runtime.
    pub fn new(storage: Arc<dyn ObjectStorage>, config: ChunkConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ChunkStoreError::InvalidArgument(format!("{e:#}")))?;
        let compressor = new_compressor(&config.compress.to_string()).ok_or_else(|| {
            ChunkStoreError::InvalidArgument(format!(
                "unknown compress algorithm: {}",
                config.compress
            ))
        })?;
        let seekable = compressor.compress_bound(0) == 0;
        let (shutdown_tx, _) = broadcast::channel(16);

        let pending = Arc::new(PendingUploads::new());
        let uploader: Uploader = {
            let pending = pending.clone();
            let delay = config.upload_delay;
            Arc::new(move |key, path, force| {
                pending.add(key, path, force);
                if force || delay.is_zero() {
                    pending.wake();
                }
            })
        };
        let bcache = new_cache_manager(&config, Some(uploader), &shutdown_tx);
        let prefetch = if config.cache_size == 0 {
            0
        } else {
            config.prefetch
        };

        let inner = Arc::new_cyclic(|me: &Weak<StoreInner>| {
            let me = me.clone();
            let fetch: FetchFn = Arc::new(move |key: String| {
                let me = me.clone();
                Box::pin(async move {
                    if let Some(store) = me.upgrade() {
                        store.prefetch(&key).await;
                    }
                })
            });
            StoreInner {
                fetcher: Prefetcher::new(prefetch, PREFETCH_QUEUE, fetch, &shutdown_tx),
                storage,
                bcache,
                compressor,
                seekable,
                group: Controller::new(),
                upload_permits: Semaphore::new(config.max_upload.max(1)),
                delete_permits: Semaphore::new(config.max_deletes.max(1)),
                pending,
                page_pool: PagePool::new(PAGE_SIZE, PAGE_POOL_CAPACITY),
                block_pool: PagePool::new(
                    config.block_size,
                    (config.buffer_size / config.block_size).clamp(1, BLOCK_POOL_CAPACITY),
                ),
                upload_limit: RateLimiter::new(config.upload_limit),
                download_limit: RateLimiter::new(config.download_limit),
                shutdown_tx: shutdown_tx.clone(),
                config,
            }
        });
        tokio::spawn(StagingUploaderTask::new(inner.clone()).run(shutdown_tx.subscribe()));
        info!(
            "Chunk store on {}: block size {} KiB, compress {}, cache {} blocks in {} shard(s), writeback {}",
            inner.storage.describe(),
            inner.config.block_size >> 10,
            inner.compressor.name(),
            inner.bcache.stats().0,
            inner.bcache.shard_count(),
            inner.config.writeback
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.inner.config
    }

    pub fn cache_manager(&self) -> &Arc<dyn CacheManager> {
        &self.inner.bcache
    }

    /// Staged blocks that still wait for their upload.
    pub fn pending_uploads(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `key` is still waiting to be uploaded.
    pub fn is_pending(&self, key: &BlockKey) -> bool {
        self.inner.pending.contains(key)
    }

    /// Keys with a remote fetch in flight.
    pub fn fetches_in_flight(&self) -> usize {
        self.inner.group.in_flight()
    }

    /// The pool of block-sized buffers shared by writers and block loads.
    pub fn block_pool(&self) -> &Arc<PagePool> {
        &self.inner.block_pool
    }
}

#[async_trait]
impl ChunkStore for CachedStore {
    fn new_reader(&self, id: u64, length: usize) -> ChunkReader {
        ChunkReader::new(self.inner.clone(), id, length)
    }

    fn new_writer(&self, id: u64) -> ChunkWriter {
        ChunkWriter::new(self.inner.clone(), id)
    }

    async fn remove(&self, id: u64, length: usize) -> Result<()> {
        self.inner.remove(id, length).await
    }

    async fn fill_cache(&self, id: u64, length: usize) -> Result<()> {
        let mut first_err = None;
        for key in self.inner.block_keys(id, length) {
            if self.inner.bcache.exists(&key) {
                continue;
            }
            if let Err(e) = self.inner.load_with_timeout(key, true).await {
                warn!("fill cache {}: {}", key, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn evict_cache(&self, id: u64, length: usize) -> Result<()> {
        for key in self.inner.block_keys(id, length) {
            self.inner.bcache.remove(&key, false).await;
        }
        Ok(())
    }

    async fn check_cache(&self, id: u64, length: usize) -> Result<u64> {
        Ok(self
            .inner
            .block_keys(id, length)
            .filter(|key| !self.inner.bcache.exists(key))
            .map(|key| key.len() as u64)
            .sum())
    }

    fn used_memory(&self) -> i64 {
        self.inner.bcache.used_memory()
    }

    fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
    }
}

impl StoreInner {
    pub(crate) fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub(crate) fn pending(&self) -> &Arc<PendingUploads> {
        &self.pending
    }

    fn should_cache(&self, size: usize) -> bool {
        self.config.should_cache(size)
    }

    /// A writable buffer of `size` bytes, pooled when it is a full block or a
    /// first-block page.
    fn alloc(&self, size: usize) -> PageMut {
        if size == self.config.block_size {
            self.block_pool.alloc(size)
        } else {
            self.page_pool.alloc(size)
        }
    }

    /// Length of block `indx` of a chunk of `length` bytes.
    fn block_len(&self, length: usize, indx: usize) -> usize {
        (length - indx * self.config.block_size).min(self.config.block_size)
    }

    fn block_key(&self, id: u64, length: usize, indx: usize) -> BlockKey {
        BlockKey::new(id, indx as u32, self.block_len(length, indx) as u32)
    }

    fn block_keys(&self, id: u64, length: usize) -> impl Iterator<Item = BlockKey> + '_ {
        let count = length.div_ceil(self.config.block_size);
        (0..count).map(move |indx| self.block_key(id, length, indx))
    }

    fn object_name(&self, key: &BlockKey) -> String {
        key.name(self.config.hash_prefix)
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        let mut buf = vec![0u8; self.compressor.compress_bound(data.len())];
        let n = self.compressor.compress(&mut buf, data)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn observe(&self, method: &str, key: &str, error: Option<&ChunkStoreError>, used: Duration) {
        let status = error.map_or_else(|| "ok".to_string(), |e| e.to_string());
        debug!("{} {} ({}, {:.3}s)", method, key, status, used.as_secs_f64());
        if used > SLOW_REQUEST {
            info!(
                "slow request: {} {} ({}, {:.3}s)",
                method,
                key,
                status,
                used.as_secs_f64()
            );
        }
        OBJECT_REQ_HIST
            .with_label_values(&[method])
            .observe(used.as_secs_f64());
        if error.is_some() {
            OBJECT_REQ_ERRORS.with_label_values(&[method]).inc();
        }
    }

    async fn get(&self, key: &str, off: u64, limit: i64) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.storage.get(key, off, limit).await;
        self.observe("GET", key, result.as_ref().err(), start.elapsed());
        let data = result?;
        OBJECT_DATA_BYTES
            .with_label_values(&["GET"])
            .inc_by(data.len() as f64);
        if let Some(limiter) = &self.download_limit {
            limiter.acquire(data.len()).await;
        }
        Ok(data)
    }

    /// Uploads one object, giving up after `put_timeout`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if let Some(limiter) = &self.upload_limit {
            limiter.acquire(data.len()).await;
        }
        let len = data.len();
        let start = Instant::now();
        let timeout = self.config.put_timeout;
        let result = match tokio::time::timeout(timeout, self.storage.put(key, data)).await {
            Ok(r) => r,
            Err(_) => Err(ChunkStoreError::Timeout(timeout)),
        };
        self.observe("PUT", key, result.as_ref().err(), start.elapsed());
        if result.is_ok() {
            OBJECT_DATA_BYTES
                .with_label_values(&["PUT"])
                .inc_by(len as f64);
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _permit = self
            .delete_permits
            .acquire()
            .await
            .map_err(|e| ChunkStoreError::Internal(e.to_string()))?;
        let start = Instant::now();
        let result = self.storage.delete(key).await;
        self.observe("DELETE", key, result.as_ref().err(), start.elapsed());
        result
    }

    /// Fetches a whole block, trying the object storage twice, and optionally
    /// caches it.
    async fn load(&self, key: BlockKey, cache: bool) -> Result<Page> {
        let name = self.object_name(&key);
        let start = Instant::now();
        let mut tried = 0u64;
        let data = loop {
            if tried > 0 {
                tokio::time::sleep(Duration::from_secs(tried * tried)).await;
            }
            match self.get(&name, 0, -1).await {
                Ok(data) => break data,
                Err(e) => {
                    tried += 1;
                    if tried >= 2 {
                        return Err(e);
                    }
                }
            }
        };
        let blen = key.len();
        let page = if self.compressor.compress_bound(blen) > blen {
            let mut out = self.alloc(blen);
            out.set_len(blen);
            let n = self.compressor.decompress(out.as_mut_slice(), &data)?;
            if n != blen {
                warn!(
                    "read {} fully: {} < {} after {:?} (tried {})",
                    name,
                    n,
                    blen,
                    start.elapsed(),
                    tried + 1
                );
                return Err(ChunkStoreError::LengthMismatch {
                    expected: blen,
                    actual: n,
                });
            }
            out.freeze()
        } else {
            if data.len() != blen {
                return Err(ChunkStoreError::LengthMismatch {
                    expected: blen,
                    actual: data.len(),
                });
            }
            // Takes over the buffer when the storage handed out the only reference.
            Page::new(Vec::from(data))
        };
        if cache {
            self.bcache.cache(&key, page.clone(), false).await;
        }
        Ok(page)
    }

    async fn load_with_timeout(&self, key: BlockKey, cache: bool) -> Result<Page> {
        let timeout = self.config.get_timeout;
        tokio::time::timeout(timeout, self.load(key, cache))
            .await
            .unwrap_or(Err(ChunkStoreError::Timeout(timeout)))
    }

    /// Loads `name` into the cache on behalf of the prefetcher.
    async fn prefetch(&self, name: &str) {
        let Some(key) = BlockKey::parse(name) else {
            return;
        };
        if key.is_empty() || key.len() > self.config.block_size || self.bcache.exists(&key) {
            return;
        }
        let result = self
            .group
            .execute(name, || self.load_with_timeout(key, true))
            .await;
        if let Err(e) = result {
            debug!("prefetch {}: {}", name, e);
        }
    }

    async fn remove(&self, id: u64, length: usize) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let mut deleted = false;
        for key in self.block_keys(id, length) {
            // Concurrent removers race here; any one deleting a block is enough.
            // A block that was only staged never reached the object storage.
            if self.pending.remove(&key).is_some() {
                deleted = true;
            }
            self.bcache.remove(&key, true).await;
            if self.delete(&self.object_name(&key)).await.is_ok() {
                deleted = true;
            }
        }
        if deleted {
            Ok(())
        } else {
            Err(ChunkStoreError::ChunkNotFound(id))
        }
    }
}

// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use chunkstore::config::ChunkConfig;
use chunkstore::core::errors::Result;
use chunkstore::core::object::{MemStorage, ObjectStorage};
use chunkstore::core::store::{CachedStore, ChunkStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Block size used by most tests: small enough to span several blocks cheaply,
/// large enough for the first block to be written in 64 KiB pages.
pub const BLOCK: usize = 256 << 10;

/// TestStore provides a chunk store backed by an in-memory object storage.
pub struct TestStore {
    pub store: CachedStore,
    pub storage: Arc<MemStorage>,
    pub dir: Option<TempDir>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// A small configuration with a memory cache and short timeouts.
pub fn test_config() -> ChunkConfig {
    ChunkConfig {
        block_size: BLOCK,
        cache_size: 64 << 20,
        buffer_size: 32 << 20,
        max_retries: 2,
        get_timeout: Duration::from_secs(5),
        put_timeout: Duration::from_secs(5),
        free_space_ratio: 0.0,
        staging_scan_interval: Duration::from_millis(100),
        cache_scan_interval: Duration::from_secs(3600),
        ..ChunkConfig::default()
    }
}

impl TestStore {
    /// Creates a store with a memory cache.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ChunkConfig) -> Self {
        init_tracing();
        let storage = Arc::new(MemStorage::new());
        let store = CachedStore::new(storage.clone() as Arc<dyn ObjectStorage>, config)
            .expect("Failed to create store");
        Self {
            store,
            storage,
            dir: None,
        }
    }

    /// Creates a store whose cache lives in a fresh temporary directory.
    pub async fn on_disk(mut config: ChunkConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        config.cache_dir = dir.path().to_string_lossy().into_owned();
        let mut ctx = Self::with_config(config).await;
        ctx.dir = Some(dir);
        ctx
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        self.dir.as_ref().expect("store has no cache dir").path()
    }

    /// Writes `data` as chunk `id` and waits for the upload to be acknowledged.
    pub async fn write_chunk(&self, id: u64, data: &[u8]) -> Result<()> {
        let mut writer = self.store.new_writer(id);
        writer.write_at(data, 0)?;
        writer.finish(data.len()).await
    }

    pub async fn read_chunk(&self, id: u64, length: usize, off: usize, n: usize) -> Result<Vec<u8>> {
        let reader = self.store.new_reader(id, length);
        let mut buf = vec![0u8; n];
        let got = reader.read_at(&mut buf, off).await?;
        buf.truncate(got);
        Ok(buf)
    }

    /// The object name of block `indx` of a chunk of `length` bytes.
    pub fn object_key(&self, id: u64, indx: usize, length: usize) -> String {
        let blen = (length - indx * BLOCK).min(BLOCK);
        format!("chunks/{}/{}/{}_{}_{}", id / 1_000_000, id / 1000, id, indx, blen)
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        self.store.shutdown();
    }
}

/// Deterministic, non-repeating test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed as u32) as u8 ^ (i >> 8) as u8)
        .collect()
}

/// Polls `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// src/core/store/reader.rs

use super::StoreInner;
use crate::core::cache::BlockKey;
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::metrics::{
    CACHE_HIT_BYTES, CACHE_HITS, CACHE_MISS, CACHE_MISS_BYTES, CACHE_READ_HIST,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reads byte ranges of one chunk, from the cache when possible.
pub struct ChunkReader {
    store: Arc<StoreInner>,
    id: u64,
    length: usize,
}

impl ChunkReader {
    pub(super) fn new(store: Arc<StoreInner>, id: u64, length: usize) -> Self {
        Self { store, id, length }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Fills `buf` from offset `off`. Returns fewer bytes than requested only when
    /// the chunk ends first.
    pub async fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let bsize = self.store.config.block_size;
        let mut got = 0;
        while got < buf.len() && off + got < self.length {
            let pos = off + got;
            let indx = pos / bsize;
            let boff = pos % bsize;
            let key = self.store.block_key(self.id, self.length, indx);
            let n = (buf.len() - got).min(key.len() - boff);
            self.read_block(key, boff, &mut buf[got..got + n]).await?;
            got += n;
        }
        Ok(got)
    }

    async fn read_block(&self, key: BlockKey, boff: usize, p: &mut [u8]) -> Result<()> {
        let store = &self.store;
        if store.config.cache_size > 0 {
            match store.bcache.load(&key).await {
                Ok(reader) => {
                    let start = Instant::now();
                    match reader.read_at(p, boff).await {
                        Ok(n) if n == p.len() => {
                            CACHE_HITS.inc();
                            CACHE_HIT_BYTES.inc_by(n as f64);
                            CACHE_READ_HIST.observe(start.elapsed().as_secs_f64());
                            return Ok(());
                        }
                        Ok(n) => warn!(
                            "remove partial cached block {}: read {} of {} bytes",
                            key,
                            n,
                            p.len()
                        ),
                        Err(e) => warn!("remove broken cached block {}: {}", key, e),
                    }
                    store.bcache.remove(&key, false).await;
                }
                Err(e) if e.is_cache_miss() => {}
                Err(e) => {
                    warn!("remove unreadable cached block {}: {}", key, e);
                    store.bcache.remove(&key, false).await;
                }
            }
        }
        CACHE_MISS.inc();
        CACHE_MISS_BYTES.inc_by(p.len() as f64);

        let name = store.object_name(&key);
        if store.seekable && boff > 0 && p.len() <= key.len() / 4 {
            // Small ranged read; bring in the whole block in the background.
            store.fetcher.fetch(name.clone());
            let timeout = store.config.get_timeout;
            let ranged = tokio::time::timeout(timeout, store.get(&name, boff as u64, p.len() as i64))
                .await
                .unwrap_or(Err(ChunkStoreError::Timeout(timeout)));
            match ranged {
                Ok(data) if data.len() == p.len() => {
                    p.copy_from_slice(&data);
                    return Ok(());
                }
                Ok(data) => debug!(
                    "short range read of {}: {} of {} bytes",
                    name,
                    data.len(),
                    p.len()
                ),
                Err(e) => debug!("range read of {}: {}", name, e),
            }
        }

        let cache = store.should_cache(key.len());
        let block = store
            .group
            .execute(&name, || store.load_with_timeout(key, cache))
            .await?;
        p.copy_from_slice(&block.as_slice()[boff..boff + p.len()]);
        Ok(())
    }
}

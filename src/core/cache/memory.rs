// src/core/cache/memory.rs

//! A block cache that keeps pages in process memory, used when no cache directory
//! is configured or usable.

use super::eviction::{CacheItem, KeyIndex, new_key_index, now_secs};
use super::{BlockKey, CacheManager, CacheReader};
use crate::config::{ChunkConfig, EvictionPolicy};
use crate::core::buffer::Page;
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::metrics::{CACHE_DROPS, CACHE_EVICTS};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

struct MemState {
    keys: Box<dyn KeyIndex>,
    pages: HashMap<BlockKey, Page>,
    used: i64,
}

pub struct MemCache {
    capacity: i64,
    policy: EvictionPolicy,
    state: Mutex<MemState>,
}

impl MemCache {
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            capacity: config.cache_size as i64,
            policy: config.cache_eviction,
            state: Mutex::new(MemState {
                keys: new_key_index(config.cache_eviction, config.cache_expire),
                pages: HashMap::new(),
                used: 0,
            }),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    fn cleanup(&self, st: &mut MemState) {
        let goal = self.capacity * 95 / 100;
        let MemState { keys, pages, used } = st;
        let Some(candidates) = keys.eviction_iter() else {
            return;
        };
        for (key, item) in candidates {
            pages.remove(&key);
            *used -= item.size as i64;
            CACHE_EVICTS.inc();
            if *used <= goal {
                break;
            }
        }
    }
}

#[async_trait]
impl CacheManager for MemCache {
    async fn cache(&self, key: &BlockKey, page: Page, _force: bool) {
        if self.capacity == 0 {
            return;
        }
        let mut st = self.state.lock();
        if st.pages.contains_key(key) {
            return;
        }
        let size = page.len() as i64;
        if self.policy == EvictionPolicy::None && st.used + size > self.capacity {
            debug!("memory cache is full, drop {} ({} bytes)", key, size);
            CACHE_DROPS.inc();
            return;
        }
        st.pages.insert(*key, page);
        st.keys.add(*key, CacheItem::new(size as i32, now_secs()));
        st.used += size;
        if st.used > self.capacity {
            self.cleanup(&mut st);
        }
    }

    async fn load(&self, key: &BlockKey) -> Result<CacheReader> {
        let mut st = self.state.lock();
        let page = st.pages.get(key).cloned().ok_or(ChunkStoreError::NotCached)?;
        st.keys.get(key);
        Ok(CacheReader::Page(page))
    }

    async fn remove(&self, key: &BlockKey, staging: bool) {
        let mut st = self.state.lock();
        if st.keys.remove(key, staging).is_some()
            && let Some(page) = st.pages.remove(key)
        {
            st.used -= page.len() as i64;
        }
    }

    async fn stage(&self, _key: &BlockKey, _data: &[u8], _keep_cache: bool) -> Result<PathBuf> {
        Err(ChunkStoreError::Internal(
            "staging is not supported by the memory cache".to_string(),
        ))
    }

    fn uploaded(&self, _key: &BlockKey, _size: usize) {}

    fn stage_path(&self, _key: &BlockKey) -> PathBuf {
        PathBuf::new()
    }

    fn exists(&self, key: &BlockKey) -> bool {
        self.state.lock().pages.contains_key(key)
    }

    fn stats(&self) -> (i64, i64) {
        let st = self.state.lock();
        (st.pages.len() as i64, st.used)
    }

    fn used_memory(&self) -> i64 {
        self.state.lock().used
    }

    fn shard_count(&self) -> usize {
        1
    }
}

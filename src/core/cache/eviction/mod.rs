// src/core/cache/eviction/mod.rs

//! Key indexes: the in-memory record of what a cache holds, and the policy that
//! decides what to evict from it.
//!
//! Every implementation maps a [`BlockKey`] to a [`CacheItem`]. Items with a
//! negative size are staged write-back blocks; no policy ever offers them for
//! eviction.

mod lru;
mod none;
mod random;

pub use lru::LruEviction;
pub use none::NoneEviction;
pub use random::RandomEviction;

use crate::config::EvictionPolicy;
use crate::core::cache::BlockKey;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size and last access time (unix seconds) of an indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheItem {
    /// Block length; negated for staged blocks that are not uploaded yet.
    pub size: i32,
    pub atime: u32,
}

impl CacheItem {
    pub fn new(size: i32, atime: u32) -> Self {
        Self { size, atime }
    }

    pub fn is_staging(&self) -> bool {
        self.size < 0
    }
}

pub type KeyIter<'a> = Box<dyn Iterator<Item = (BlockKey, CacheItem)> + 'a>;

/// The interface shared by all eviction policies.
pub trait KeyIndex: Send {
    fn name(&self) -> &'static str;

    /// Inserts or replaces the entry for `key`.
    fn add(&mut self, key: BlockKey, item: CacheItem);

    /// Removes `key`. Staged entries are only removed when `staging` is set.
    fn remove(&mut self, key: &BlockKey, staging: bool) -> Option<CacheItem>;

    /// Looks up `key`, refreshing its access time.
    fn get(&mut self, key: &BlockKey) -> Option<CacheItem>;

    /// Looks up `key` without touching its access time.
    fn peek(&self, key: &BlockKey) -> Option<CacheItem>;

    fn peek_atime(&self, key: &BlockKey) -> u32 {
        self.peek(key).map(|item| item.atime).unwrap_or(0)
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps in an empty index of the same policy and returns the old one.
    fn reset(&mut self) -> Box<dyn KeyIndex>;

    /// Visits every entry in no particular order.
    fn random_iter(&self) -> KeyIter<'_>;

    /// Yields eviction candidates in policy order, removing each one from the
    /// index as it is yielded. `None` if the policy never evicts.
    fn eviction_iter(&mut self) -> Option<KeyIter<'_>>;
}

/// Creates the key index for `policy`. `cache_expire` only affects `2-random`.
pub fn new_key_index(policy: EvictionPolicy, cache_expire: Duration) -> Box<dyn KeyIndex> {
    match policy {
        EvictionPolicy::None => Box::new(NoneEviction::new()),
        EvictionPolicy::TwoRandom => Box::new(RandomEviction::new(cache_expire)),
        EvictionPolicy::Lru => Box::new(LruEviction::new()),
    }
}

/// Current unix time in seconds, as stored in [`CacheItem::atime`].
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Shared removal rule: staged entries survive unless `staging` is requested.
fn removable(item: &CacheItem, staging: bool) -> bool {
    staging || !item.is_staging()
}

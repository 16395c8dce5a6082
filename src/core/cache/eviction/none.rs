// src/core/cache/eviction/none.rs

use super::{CacheItem, KeyIndex, KeyIter, now_secs, removable};
use crate::core::cache::BlockKey;
use std::collections::HashMap;

/// Tracks entries but never evicts any of them.
#[derive(Debug, Default)]
pub struct NoneEviction {
    keys: HashMap<BlockKey, CacheItem>,
}

impl NoneEviction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyIndex for NoneEviction {
    fn name(&self) -> &'static str {
        "none"
    }

    fn add(&mut self, key: BlockKey, item: CacheItem) {
        self.keys.insert(key, item);
    }

    fn remove(&mut self, key: &BlockKey, staging: bool) -> Option<CacheItem> {
        remove_entry(&mut self.keys, key, staging)
    }

    fn get(&mut self, key: &BlockKey) -> Option<CacheItem> {
        touch(&mut self.keys, key)
    }

    fn peek(&self, key: &BlockKey) -> Option<CacheItem> {
        self.keys.get(key).copied()
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn reset(&mut self) -> Box<dyn KeyIndex> {
        Box::new(std::mem::take(self))
    }

    fn random_iter(&self) -> KeyIter<'_> {
        Box::new(self.keys.iter().map(|(k, v)| (*k, *v)))
    }

    fn eviction_iter(&mut self) -> Option<KeyIter<'_>> {
        None
    }
}

pub(super) fn remove_entry(
    keys: &mut HashMap<BlockKey, CacheItem>,
    key: &BlockKey,
    staging: bool,
) -> Option<CacheItem> {
    match keys.get(key) {
        Some(item) if removable(item, staging) => keys.remove(key),
        _ => None,
    }
}

pub(super) fn touch(keys: &mut HashMap<BlockKey, CacheItem>, key: &BlockKey) -> Option<CacheItem> {
    let item = keys.get_mut(key)?;
    item.atime = now_secs();
    Some(*item)
}

// src/core/cache/eviction/random.rs

use super::none::{remove_entry, touch};
use super::{CacheItem, KeyIndex, KeyIter, now_secs};
use crate::core::cache::BlockKey;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;

/// Evicts the less recently used of two randomly sampled entries.
///
/// With a non-zero expiry, any sampled entry not accessed within it is evicted
/// immediately, without comparing it to a peer.
#[derive(Debug)]
pub struct RandomEviction {
    keys: HashMap<BlockKey, CacheItem>,
    expire: u32,
    rng: SmallRng,
    pairs: Option<Vec<(CacheItem, CacheItem)>>,
}

impl RandomEviction {
    pub fn new(cache_expire: Duration) -> Self {
        Self {
            keys: HashMap::new(),
            expire: cache_expire.as_secs().min(u32::MAX as u64) as u32,
            rng: SmallRng::from_entropy(),
            pairs: None,
        }
    }

    /// Starts keeping the `(evicted, kept)` items of every compared pair.
    pub fn record_pairs(&mut self) {
        self.pairs.get_or_insert_with(Vec::new);
    }

    /// Drains the pairs recorded since the last call.
    pub fn take_pairs(&mut self) -> Vec<(CacheItem, CacheItem)> {
        self.pairs.as_mut().map(std::mem::take).unwrap_or_default()
    }
}

impl KeyIndex for RandomEviction {
    fn name(&self) -> &'static str {
        "2-random"
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
        let fresh = RandomEviction {
            keys: HashMap::new(),
            expire: self.expire,
            rng: SmallRng::from_entropy(),
            pairs: None,
        };
        Box::new(std::mem::replace(self, fresh))
    }

    fn random_iter(&self) -> KeyIter<'_> {
        Box::new(self.keys.iter().map(|(k, v)| (*k, *v)))
    }

    fn eviction_iter(&mut self) -> Option<KeyIter<'_>> {
        let mut candidates: Vec<BlockKey> = self
            .keys
            .iter()
            .filter(|(_, item)| !item.is_staging())
            .map(|(k, _)| *k)
            .collect();
        candidates.shuffle(&mut self.rng);
        let cutoff = if self.expire > 0 {
            now_secs().saturating_sub(self.expire)
        } else {
            0
        };
        Some(Box::new(PairSampler {
            keys: &mut self.keys,
            candidates: candidates.into_iter(),
            cutoff,
            last: None,
            pairs: self.pairs.as_mut(),
        }))
    }
}

struct PairSampler<'a> {
    keys: &'a mut HashMap<BlockKey, CacheItem>,
    candidates: std::vec::IntoIter<BlockKey>,
    cutoff: u32,
    last: Option<(BlockKey, CacheItem)>,
    pairs: Option<&'a mut Vec<(CacheItem, CacheItem)>>,
}

impl PairSampler<'_> {
    fn evict(&mut self, key: BlockKey, item: CacheItem) -> Option<(BlockKey, CacheItem)> {
        self.keys.remove(&key);
        Some((key, item))
    }
}

impl Iterator for PairSampler<'_> {
    type Item = (BlockKey, CacheItem);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(key) = self.candidates.next() else {
                // An unpaired sample is still better than nothing.
                let (key, item) = self.last.take()?;
                return self.evict(key, item);
            };
            let Some(item) = self.keys.get(&key).copied() else {
                continue;
            };
            if item.is_staging() {
                continue;
            }
            if self.cutoff > 0 && item.atime < self.cutoff {
                return self.evict(key, item);
            }
            match self.last.take() {
                None => self.last = Some((key, item)),
                Some((last_key, last_item)) => {
                    let ((key, item), kept) = if last_item.atime > item.atime {
                        ((key, item), last_item)
                    } else {
                        ((last_key, last_item), item)
                    };
                    if let Some(pairs) = self.pairs.as_mut() {
                        pairs.push((item, kept));
                    }
                    return self.evict(key, item);
                }
            }
        }
    }
}

// src/core/cache/eviction/lru.rs

use super::{CacheItem, KeyIndex, KeyIter, now_secs, removable};
use crate::core::cache::BlockKey;
use std::collections::HashMap;

/// Heap position of entries that are not in the heap (staged blocks).
const NOT_IN_HEAP: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct LruEntry {
    item: CacheItem,
    pos: usize,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    key: BlockKey,
    atime: u32,
    size: i32,
}

/// Evicts in least-recently-used order using a binary min-heap.
///
/// Ties on access time go to the larger block first, then to the lower key, so the
/// eviction order is fully deterministic. Staged entries live in the map only.
#[derive(Debug, Default)]
pub struct LruEviction {
    keys: HashMap<BlockKey, LruEntry>,
    heap: Vec<HeapEntry>,
}

fn less(a: &HeapEntry, b: &HeapEntry) -> bool {
    if a.atime != b.atime {
        return a.atime < b.atime;
    }
    if a.size != b.size {
        return a.size > b.size;
    }
    (a.key.id, a.key.index) < (b.key.id, b.key.index)
}

impl LruEviction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently in the heap.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Checks that the heap and the map agree: every heap slot points back at its
    /// map entry, the min-heap property holds, staged entries are not in the heap,
    /// and every other entry is.
    pub fn verify_heap(&self) -> bool {
        for (i, entry) in self.heap.iter().enumerate() {
            let Some(mapped) = self.keys.get(&entry.key) else {
                return false;
            };
            if mapped.pos != i
                || mapped.item.atime != entry.atime
                || mapped.item.size != entry.size
                || mapped.item.is_staging()
            {
                return false;
            }
            if i > 0 && less(entry, &self.heap[(i - 1) / 2]) {
                return false;
            }
        }
        let mut in_heap = 0;
        for entry in self.keys.values() {
            if entry.item.is_staging() {
                if entry.pos != NOT_IN_HEAP {
                    return false;
                }
            } else if entry.pos == NOT_IN_HEAP || entry.pos >= self.heap.len() {
                return false;
            } else {
                in_heap += 1;
            }
        }
        in_heap == self.heap.len()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        if let Some(e) = self.keys.get_mut(&self.heap[i].key) {
            e.pos = i;
        }
        if let Some(e) = self.keys.get_mut(&self.heap[j].key) {
            e.pos = j;
        }
    }

    fn up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !less(&self.heap[i], &self.heap[parent]) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Sifts `i0` down; returns whether it moved.
    fn down(&mut self, i0: usize) -> bool {
        let n = self.heap.len();
        let mut i = i0;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && less(&self.heap[right], &self.heap[left]) {
                child = right;
            }
            if !less(&self.heap[child], &self.heap[i]) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > i0
    }

    fn fix(&mut self, i: usize) {
        if !self.down(i) {
            self.up(i);
        }
    }

    fn push(&mut self, key: BlockKey, item: CacheItem) {
        let pos = self.heap.len();
        self.heap.push(HeapEntry {
            key,
            atime: item.atime,
            size: item.size,
        });
        if let Some(e) = self.keys.get_mut(&key) {
            e.pos = pos;
        }
        self.up(pos);
    }

    /// Removes the heap slot `i`, marking its entry as out of the heap.
    fn heap_remove(&mut self, i: usize) -> Option<HeapEntry> {
        let last = self.heap.len().checked_sub(1)?;
        if i != last {
            self.swap(i, last);
        }
        let removed = self.heap.pop()?;
        if let Some(e) = self.keys.get_mut(&removed.key) {
            e.pos = NOT_IN_HEAP;
        }
        if i < self.heap.len() {
            self.fix(i);
        }
        Some(removed)
    }
}

impl KeyIndex for LruEviction {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn add(&mut self, key: BlockKey, item: CacheItem) {
        let pos = match self.keys.get_mut(&key) {
            Some(entry) => {
                entry.item = item;
                entry.pos
            }
            None => {
                self.keys.insert(key, LruEntry { item, pos: NOT_IN_HEAP });
                NOT_IN_HEAP
            }
        };
        match (pos == NOT_IN_HEAP, item.is_staging()) {
            (true, false) => self.push(key, item),
            (false, true) => {
                self.heap_remove(pos);
            }
            (false, false) => {
                self.heap[pos].atime = item.atime;
                self.heap[pos].size = item.size;
                self.fix(pos);
            }
            (true, true) => {}
        }
    }

    fn remove(&mut self, key: &BlockKey, staging: bool) -> Option<CacheItem> {
        let entry = *self.keys.get(key)?;
        if !removable(&entry.item, staging) {
            return None;
        }
        if entry.pos != NOT_IN_HEAP {
            self.heap_remove(entry.pos);
        }
        self.keys.remove(key).map(|e| e.item)
    }

    fn get(&mut self, key: &BlockKey) -> Option<CacheItem> {
        let now = now_secs();
        let entry = self.keys.get_mut(key)?;
        entry.item.atime = now;
        let (item, pos) = (entry.item, entry.pos);
        if pos != NOT_IN_HEAP {
            self.heap[pos].atime = now;
            self.fix(pos);
        }
        Some(item)
    }

    fn peek(&self, key: &BlockKey) -> Option<CacheItem> {
        self.keys.get(key).map(|e| e.item)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn reset(&mut self) -> Box<dyn KeyIndex> {
        Box::new(std::mem::take(self))
    }

    fn random_iter(&self) -> KeyIter<'_> {
        Box::new(self.keys.iter().map(|(k, e)| (*k, e.item)))
    }

    fn eviction_iter(&mut self) -> Option<KeyIter<'_>> {
        Some(Box::new(LruDrain { lru: self }))
    }
}

struct LruDrain<'a> {
    lru: &'a mut LruEviction,
}

impl Iterator for LruDrain<'_> {
    type Item = (BlockKey, CacheItem);

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.lru.heap_remove(0)?;
        let entry = self.lru.keys.remove(&top.key)?;
        Some((top.key, entry.item))
    }
}

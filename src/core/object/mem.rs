// src/core/object/mem.rs

use super::{ObjectInfo, ObjectStorage, range};
use crate::core::errors::{ChunkStoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Objects kept in a concurrent map. Lost when dropped.
///
/// Requests are counted, and failures or latency can be injected, which makes it
/// the backend of choice for exercising retry and timeout paths.
#[derive(Default)]
pub struct MemStorage {
    objects: DashMap<String, (Bytes, SystemTime)>,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    failing_gets: AtomicU32,
    failing_puts: AtomicU32,
    failing_deletes: AtomicU32,
    get_delay: Mutex<Duration>,
    put_delay: Mutex<Duration>,
}

/// Consumes one injected failure, if any is left.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Makes the next `n` GETs fail with a transient error.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::Release);
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::Release);
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::Release);
    }

    /// Delays every GET by `delay`.
    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock() = delay;
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Acquire)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Acquire)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ObjectStorage for MemStorage {
    fn describe(&self) -> String {
        "mem://".to_string()
    }

    async fn get(&self, key: &str, off: u64, limit: i64) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::AcqRel);
        let delay = *self.get_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.failing_gets) {
            return Err(ChunkStoreError::Remote(format!("injected GET failure for {key}")));
        }
        let data = self
            .objects
            .get(key)
            .map(|e| e.value().0.clone())
            .ok_or_else(|| ChunkStoreError::ObjectNotFound(key.to_string()))?;
        range(&data, off, limit)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::AcqRel);
        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.failing_puts) {
            return Err(ChunkStoreError::Remote(format!("injected PUT failure for {key}")));
        }
        self.objects
            .insert(key.to_string(), (data, SystemTime::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::AcqRel);
        if take_failure(&self.failing_deletes) {
            return Err(ChunkStoreError::Remote(format!("injected DELETE failure for {key}")));
        }
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ChunkStoreError::ObjectNotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        let mut found: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.key().as_str() > marker)
            .map(|e| ObjectInfo {
                key: e.key().clone(),
                size: e.value().0.len() as u64,
                mtime: e.value().1,
            })
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found.truncate(limit);
        Ok(found)
    }
}

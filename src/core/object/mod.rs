// src/core/object/mod.rs

//! The object storage the chunk store uploads blocks to.
//!
//! Only the interface is needed by the store; the two implementations here keep
//! objects in memory or in a local directory.

mod file;
mod mem;

pub use file::FileStorage;
pub use mem::MemStorage;

use crate::core::errors::{ChunkStoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub mtime: SystemTime,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn describe(&self) -> String;

    /// Reads `limit` bytes of `key` starting at `off`. `off = 0, limit = -1`
    /// reads the whole object.
    async fn get(&self, key: &str, off: u64, limit: i64) -> Result<Bytes>;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fails with [`ChunkStoreError::ObjectNotFound`] when `key` does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Objects whose key starts with `prefix` and sorts after `marker`, in key
    /// order, at most `limit` of them.
    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<ObjectInfo>>;
}

/// Cuts the requested range out of a whole object.
fn range(data: &Bytes, off: u64, limit: i64) -> Result<Bytes> {
    let len = data.len() as u64;
    if off > len {
        return Err(ChunkStoreError::InvalidArgument(format!(
            "offset {off} beyond object size {len}"
        )));
    }
    let end = if limit < 0 {
        len
    } else {
        (off + limit as u64).min(len)
    };
    Ok(data.slice(off as usize..end as usize))
}

// src/core/cache/key.rs

//! Naming of blocks in the object storage and in cache directories.

use std::fmt;

/// Identifies one block of a chunk: `{chunk id, block index, block length}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub id: u64,
    pub index: u32,
    pub size: u32,
}

impl BlockKey {
    pub fn new(id: u64, index: u32, size: u32) -> Self {
        Self { id, index, size }
    }

    /// The object name of this block.
    ///
    /// Without a hash prefix: `chunks/{id/1e6}/{id/1e3}/{id}_{index}_{size}`.
    /// With one: `chunks/{id%256 as hex}/{id/1e6}/{id}_{index}_{size}`.
    pub fn name(&self, hash_prefix: bool) -> String {
        if hash_prefix {
            format!(
                "chunks/{:02X}/{}/{}",
                self.id % 256,
                self.id / 1_000_000,
                self.file_name()
            )
        } else {
            format!(
                "chunks/{}/{}/{}",
                self.id / 1_000_000,
                self.id / 1000,
                self.file_name()
            )
        }
    }

    /// The last path component, `{id}_{index}_{size}`.
    pub fn file_name(&self) -> String {
        format!("{}_{}_{}", self.id, self.index, self.size)
    }

    /// Parses a key from an object name or path; only the final component matters.
    pub fn parse(name: &str) -> Option<Self> {
        let base = name.rsplit(['/', '\\']).next()?;
        let mut parts = base.split('_');
        let id = parts.next()?.parse().ok()?;
        let index = parts.next()?.parse().ok()?;
        let size = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { id, index, size })
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(false))
    }
}

/// Recovers the block length encoded after the last `_` of an object name.
pub fn parse_size(name: &str) -> usize {
    name.rsplit_once('_')
        .and_then(|(_, size)| size.parse().ok())
        .unwrap_or(0)
}

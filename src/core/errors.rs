// src/core/errors.rs

//! Defines the primary error type for the storage engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
///
/// Errors are cloneable so that a single failed fetch can be handed to every
/// caller that was waiting on it.
#[derive(Error, Debug, Clone)]
pub enum ChunkStoreError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The block is not present in the local cache.
    #[error("not cached")]
    NotCached,

    /// A cached file failed CRC32C verification.
    #[error("checksum mismatch in {path:?} at segment {segment}")]
    ChecksumMismatch { path: PathBuf, segment: usize },

    #[error("space not enough on device: {0}")]
    NoSpace(String),

    #[error("cache down")]
    CacheDown,

    #[error("exceed concurrency {0} limit for unstable disk cache")]
    CacheOverloaded(i64),

    /// A transient failure reported by the object storage.
    #[error("object storage error: {0}")]
    Remote(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("chunk {0} not found")]
    ChunkNotFound(u64),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("compression error: {0}")]
    Compress(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("length mismatch: {actual} != {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl ChunkStoreError {
    /// Errors that the disk-health state machine counts against a cache directory.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, ChunkStoreError::Io(e) if e.kind() != std::io::ErrorKind::NotFound)
    }

    /// Local cache misses that should silently fall through to the object storage.
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            ChunkStoreError::NotCached | ChunkStoreError::CacheDown | ChunkStoreError::CacheOverloaded(_)
        ) || matches!(self, ChunkStoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl PartialEq for ChunkStoreError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ChunkStoreError::Io(e1), ChunkStoreError::Io(e2)) => e1.to_string() == e2.to_string(),
            (
                ChunkStoreError::ChecksumMismatch { path: p1, segment: s1 },
                ChunkStoreError::ChecksumMismatch { path: p2, segment: s2 },
            ) => p1 == p2 && s1 == s2,
            (ChunkStoreError::NoSpace(s1), ChunkStoreError::NoSpace(s2)) => s1 == s2,
            (ChunkStoreError::CacheOverloaded(a), ChunkStoreError::CacheOverloaded(b)) => a == b,
            (ChunkStoreError::Remote(s1), ChunkStoreError::Remote(s2)) => s1 == s2,
            (ChunkStoreError::ObjectNotFound(s1), ChunkStoreError::ObjectNotFound(s2)) => s1 == s2,
            (ChunkStoreError::ChunkNotFound(a), ChunkStoreError::ChunkNotFound(b)) => a == b,
            (ChunkStoreError::Timeout(a), ChunkStoreError::Timeout(b)) => a == b,
            (ChunkStoreError::Compress(s1), ChunkStoreError::Compress(s2)) => s1 == s2,
            (ChunkStoreError::InvalidArgument(s1), ChunkStoreError::InvalidArgument(s2)) => s1 == s2,
            (
                ChunkStoreError::LengthMismatch { expected: e1, actual: a1 },
                ChunkStoreError::LengthMismatch { expected: e2, actual: a2 },
            ) => e1 == e2 && a1 == a2,
            (ChunkStoreError::Internal(s1), ChunkStoreError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ChunkStoreError {
    fn from(e: std::io::Error) -> Self {
        ChunkStoreError::Io(Arc::new(e))
    }
}

impl From<tokio::task::JoinError> for ChunkStoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChunkStoreError::Internal(format!("background task failed: {e}"))
    }
}

impl From<lz4_flex::block::DecompressError> for ChunkStoreError {
    fn from(e: lz4_flex::block::DecompressError) -> Self {
        ChunkStoreError::Compress(e.to_string())
    }
}

/// A convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ChunkStoreError>;

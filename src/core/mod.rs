// src/core/mod.rs

//! The storage engine: buffers, the block cache, and the chunked store on top of
//! an object storage.

pub mod buffer;
pub mod cache;
pub mod checksum;
pub mod compress;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod object;
pub mod prefetch;
pub mod singleflight;
pub mod store;
pub mod tasks;

pub use errors::ChunkStoreError;
pub use store::{CachedStore, ChunkReader, ChunkStore, ChunkWriter};

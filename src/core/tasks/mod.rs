// src/core/tasks/mod.rs

//! Long-running background tasks that keep the block cache and the staging area
//! in shape.

pub mod cache_flusher;
pub mod cache_scanner;
pub mod free_space;
pub mod staging_uploader;

// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the block cache and object requests.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder, exponential_buckets,
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec,
};

lazy_static! {
    // --- Block cache reads ---
    pub static ref CACHE_HITS: Counter =
        register_counter!("chunkstore_blockcache_hits", "Read blocks from cache.").unwrap();
    pub static ref CACHE_MISS: Counter =
        register_counter!("chunkstore_blockcache_miss", "Missed read blocks from cache.").unwrap();
    pub static ref CACHE_HIT_BYTES: Counter =
        register_counter!("chunkstore_blockcache_hit_bytes", "Read bytes from cached blocks.").unwrap();
    pub static ref CACHE_MISS_BYTES: Counter =
        register_counter!("chunkstore_blockcache_miss_bytes", "Missed bytes from cached blocks.").unwrap();
    pub static ref CACHE_READ_HIST: Histogram = register_histogram!(
        "chunkstore_blockcache_read_hist_seconds",
        "Histogram of read latency of cached blocks.",
        exponential_buckets(0.00001, 2.0, 20).unwrap()
    )
    .unwrap();

    // --- Block cache writes ---
    pub static ref CACHE_WRITES: Counter =
        register_counter!("chunkstore_blockcache_writes", "Written cached blocks.").unwrap();
    pub static ref CACHE_WRITE_BYTES: Counter =
        register_counter!("chunkstore_blockcache_write_bytes", "Written bytes of cached blocks.").unwrap();
    pub static ref CACHE_WRITE_HIST: Histogram = register_histogram!(
        "chunkstore_blockcache_write_hist_seconds",
        "Write cached block latency distribution.",
        exponential_buckets(0.00001, 2.0, 20).unwrap()
    )
    .unwrap();
    pub static ref CACHE_DROPS: Counter =
        register_counter!("chunkstore_blockcache_drops", "Dropped blocks because the write queue was full.").unwrap();
    pub static ref CACHE_EVICTS: Counter =
        register_counter!("chunkstore_blockcache_evicts", "Evicted cache blocks.").unwrap();

    // --- Cache usage, refreshed by the metrics handler ---
    pub static ref CACHE_BLOCKS: Gauge =
        register_gauge!("chunkstore_blockcache_blocks", "Number of cached blocks.").unwrap();
    pub static ref CACHE_BYTES: Gauge =
        register_gauge!("chunkstore_blockcache_bytes", "Size of cached blocks in bytes.").unwrap();
    pub static ref BUFFER_USED_BYTES: Gauge =
        register_gauge!("chunkstore_used_buffer_size_bytes", "Memory held by live block buffers.").unwrap();
    /// 0 = normal, 1 = unstable, 2 = down.
    pub static ref DISK_CACHE_STATE: GaugeVec = register_gauge_vec!(
        "chunkstore_disk_cache_state",
        "Health state of each cache directory.",
        &["dir"]
    )
    .unwrap();

    // --- Staging (write-back) ---
    pub static ref STAGING_BLOCKS: Gauge =
        register_gauge!("chunkstore_staging_blocks", "Number of blocks in the staging path.").unwrap();
    pub static ref STAGING_BLOCK_BYTES: Gauge =
        register_gauge!("chunkstore_staging_block_bytes", "Total bytes of blocks in the staging path.").unwrap();
    pub static ref STAGING_BLOCK_DELAY: Histogram = register_histogram!(
        "chunkstore_staging_block_delay_seconds",
        "Time between staging a block and its upload.",
        exponential_buckets(0.01, 2.0, 20).unwrap()
    )
    .unwrap();

    // --- Object storage requests ---
    pub static ref OBJECT_REQ_HIST: HistogramVec = register_histogram_vec!(
        "chunkstore_object_request_durations_histogram_seconds",
        "Object requests latency distributions.",
        &["method"],
        exponential_buckets(0.01, 1.5, 25).unwrap()
    )
    .unwrap();
    pub static ref OBJECT_REQ_ERRORS: CounterVec = register_counter_vec!(
        "chunkstore_object_request_errors",
        "Failed requests to object store.",
        &["method"]
    )
    .unwrap();
    pub static ref OBJECT_DATA_BYTES: CounterVec = register_counter_vec!(
        "chunkstore_object_request_data_bytes",
        "Object requests size in bytes.",
        &["method"]
    )
    .unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

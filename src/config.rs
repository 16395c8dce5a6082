// src/config.rs

//! Manages engine configuration: loading, resolving dynamic values, and validation.

use crate::core::store::CHUNK_SIZE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use sysinfo::System;
use tracing::{info, warn};

/// The eviction algorithm used by a cache directory (or the memory cache).
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
pub enum EvictionPolicy {
    /// Never evict; the cache grows until something external bounds it.
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    None,
    /// Sample two entries and evict the one accessed less recently.
    #[default]
    #[serde(rename = "2-random")]
    #[strum(serialize = "2-random")]
    TwoRandom,
    /// Evict in least-recently-used order.
    #[serde(rename = "lru")]
    #[strum(serialize = "lru")]
    Lru,
}

/// How much of a cached block is verified against its checksum trailer on read.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumLevel {
    /// Never verify; no trailer is written.
    None,
    /// Verify only reads that cover the whole block.
    #[default]
    Full,
    /// Verify the segments fully covered by the read.
    Shrink,
    /// Widen the read to segment boundaries and verify all of it.
    Extend,
}

/// The codec applied to blocks before they are uploaded.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompressAlgorithm {
    #[default]
    None,
    Zstd,
    Lz4,
}

/// The object storage backend used by the binary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Objects live in process memory and are lost on exit.
    #[default]
    Memory,
    /// Objects are files under `path`.
    File,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "chunkstore_data/objects".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            path: default_storage_path(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9567
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Thresholds of the per-directory disk health state machine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiskHealthConfig {
    /// I/O errors within one `normal_tick` that demote a directory to unstable.
    #[serde(default = "default_io_errors_to_unstable")]
    pub io_errors_to_unstable: u32,
    /// Operations observed during one unstable tick before promotion is considered.
    #[serde(default = "default_min_io_success_to_normal")]
    pub min_io_success_to_normal: u32,
    /// Highest error ratio (0.0 - 1.0) that still allows promotion back to normal.
    #[serde(default)]
    pub max_io_error_ratio_to_normal: f64,
    /// Time spent unstable after which the directory is taken down.
    #[serde(with = "humantime_serde", default = "default_max_duration_to_down")]
    pub max_duration_to_down: Duration,
    /// Concurrent cache operations allowed while unstable.
    #[serde(default = "default_max_concurrency_for_unstable")]
    pub max_concurrency_for_unstable: i64,
    #[serde(with = "humantime_serde", default = "default_health_tick")]
    pub normal_tick: Duration,
    #[serde(with = "humantime_serde", default = "default_health_tick")]
    pub unstable_tick: Duration,
    /// Pause between synthetic probes of an unstable directory.
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// Disk operations slower than this count as I/O errors.
    #[serde(with = "humantime_serde", default = "default_max_io_duration")]
    pub max_io_duration: Duration,
}

fn default_io_errors_to_unstable() -> u32 {
    3
}
fn default_min_io_success_to_normal() -> u32 {
    60
}
fn default_max_duration_to_down() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_max_concurrency_for_unstable() -> i64 {
    10
}
fn default_health_tick() -> Duration {
    Duration::from_secs(60)
}
fn default_probe_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_max_io_duration() -> Duration {
    Duration::from_secs(20)
}

impl Default for DiskHealthConfig {
    fn default() -> Self {
        Self {
            io_errors_to_unstable: default_io_errors_to_unstable(),
            min_io_success_to_normal: default_min_io_success_to_normal(),
            max_io_error_ratio_to_normal: 0.0,
            max_duration_to_down: default_max_duration_to_down(),
            max_concurrency_for_unstable: default_max_concurrency_for_unstable(),
            normal_tick: default_health_tick(),
            unstable_tick: default_health_tick(),
            probe_interval: default_probe_interval(),
            max_io_duration: default_max_io_duration(),
        }
    }
}

/// Options of the chunked store and its block cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkConfig {
    /// `memory`, or a `:`-separated list of directories (wildcards allowed).
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Permission bits of cached files.
    #[serde(default = "default_cache_mode")]
    pub cache_mode: u32,
    /// Total cache capacity in bytes, split evenly across directories.
    #[serde(default = "default_cache_size", deserialize_with = "deserialize_size")]
    pub cache_size: u64,
    /// Minimum ratio of free space and inodes to keep on each cache device.
    #[serde(default = "default_free_space_ratio")]
    pub free_space_ratio: f32,
    /// Create missing cache directories instead of skipping them.
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default)]
    pub cache_eviction: EvictionPolicy,
    /// Cached blocks not accessed for this long are evicted first. `0s` disables it.
    #[serde(with = "humantime_serde", default)]
    pub cache_expire: Duration,
    /// Interval between full rescans of each cache directory.
    #[serde(with = "humantime_serde", default = "default_cache_scan_interval")]
    pub cache_scan_interval: Duration,
    #[serde(default)]
    pub cache_checksum: ChecksumLevel,
    /// Cache full blocks as well as partial (tail) blocks.
    #[serde(default = "default_true")]
    pub cache_full_block: bool,
    /// Spread object keys over 256 hex prefixes.
    #[serde(default)]
    pub hash_prefix: bool,
    #[serde(default = "default_block_size", deserialize_with = "deserialize_size_usize")]
    pub block_size: usize,
    #[serde(default)]
    pub compress: CompressAlgorithm,
    /// Concurrent uploads.
    #[serde(default = "default_max_upload")]
    pub max_upload: usize,
    /// Concurrent deletes.
    #[serde(default = "default_max_deletes")]
    pub max_deletes: usize,
    /// Retries of a failed upload before it is reported.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Acknowledge writes once they are staged on local disk.
    #[serde(default)]
    pub writeback: bool,
    /// fsync staged blocks before acknowledging them.
    #[serde(default)]
    pub writeback_fsync: bool,
    /// Minimum age of a staged block before it is uploaded.
    #[serde(with = "humantime_serde", default)]
    pub upload_delay: Duration,
    /// Interval at which delayed staged blocks are checked for upload.
    #[serde(with = "humantime_serde", default = "default_staging_scan_interval")]
    pub staging_scan_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub get_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub put_timeout: Duration,
    /// Memory for read/write buffers. Resolved from a size or a percentage of
    /// available memory when loading from a file.
    #[serde(skip, default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Background workers that prefetch whole blocks after a ranged read.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Upload bandwidth in bytes per second. `0` means unlimited.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub upload_limit: u64,
    /// Download bandwidth in bytes per second. `0` means unlimited.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub download_limit: u64,
    #[serde(with = "humantime_serde", default = "default_free_space_check_interval")]
    pub free_space_check_interval: Duration,
    #[serde(default)]
    pub disk_health: DiskHealthConfig,
}

fn default_cache_dir() -> String {
    "memory".to_string()
}
fn default_cache_mode() -> u32 {
    0o600
}
fn default_cache_size() -> u64 {
    100 << 20
}
fn default_free_space_ratio() -> f32 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_cache_scan_interval() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_block_size() -> usize {
    4 << 20
}
fn default_max_upload() -> usize {
    20
}
fn default_max_deletes() -> usize {
    10
}
fn default_max_retries() -> u32 {
    10
}
fn default_staging_scan_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_buffer_size() -> usize {
    300 << 20
}
fn default_prefetch() -> usize {
    1
}
fn default_free_space_check_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_mode: default_cache_mode(),
            cache_size: default_cache_size(),
            free_space_ratio: default_free_space_ratio(),
            auto_create: true,
            cache_eviction: EvictionPolicy::default(),
            cache_expire: Duration::ZERO,
            cache_scan_interval: default_cache_scan_interval(),
            cache_checksum: ChecksumLevel::default(),
            cache_full_block: true,
            hash_prefix: false,
            block_size: default_block_size(),
            compress: CompressAlgorithm::default(),
            max_upload: default_max_upload(),
            max_deletes: default_max_deletes(),
            max_retries: default_max_retries(),
            writeback: false,
            writeback_fsync: false,
            upload_delay: Duration::ZERO,
            staging_scan_interval: default_staging_scan_interval(),
            get_timeout: default_request_timeout(),
            put_timeout: default_request_timeout(),
            buffer_size: default_buffer_size(),
            prefetch: default_prefetch(),
            upload_limit: 0,
            download_limit: 0,
            free_space_check_interval: default_free_space_check_interval(),
            disk_health: DiskHealthConfig::default(),
        }
    }
}

impl ChunkConfig {
    /// Validates the chunk options for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > CHUNK_SIZE {
            return Err(anyhow!(
                "block_size must be between 1 and {} bytes, got {}",
                CHUNK_SIZE,
                self.block_size
            ));
        }
        if CHUNK_SIZE % self.block_size != 0 {
            return Err(anyhow!(
                "block_size {} must evenly divide the chunk size {}",
                self.block_size,
                CHUNK_SIZE
            ));
        }
        if !(0.0..1.0).contains(&self.free_space_ratio) {
            return Err(anyhow!(
                "free_space_ratio must be in [0, 1), got {}",
                self.free_space_ratio
            ));
        }
        if self.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir cannot be empty"));
        }
        if self.max_upload == 0 {
            return Err(anyhow!("max_upload cannot be 0"));
        }
        if self.max_deletes == 0 {
            return Err(anyhow!("max_deletes cannot be 0"));
        }
        if self.get_timeout.is_zero() || self.put_timeout.is_zero() {
            return Err(anyhow!("get_timeout and put_timeout must be greater than 0"));
        }
        if self.staging_scan_interval.is_zero() || self.free_space_check_interval.is_zero() {
            return Err(anyhow!(
                "staging_scan_interval and free_space_check_interval must be greater than 0"
            ));
        }
        if self.cache_scan_interval.is_zero() {
            return Err(anyhow!("cache_scan_interval must be greater than 0"));
        }

        let health = &self.disk_health;
        if health.io_errors_to_unstable == 0 {
            return Err(anyhow!("disk_health.io_errors_to_unstable cannot be 0"));
        }
        if !(0.0..=1.0).contains(&health.max_io_error_ratio_to_normal) {
            return Err(anyhow!(
                "disk_health.max_io_error_ratio_to_normal must be in [0, 1]"
            ));
        }
        if health.max_concurrency_for_unstable <= 0 {
            return Err(anyhow!(
                "disk_health.max_concurrency_for_unstable must be greater than 0"
            ));
        }
        if health.normal_tick.is_zero()
            || health.unstable_tick.is_zero()
            || health.probe_interval.is_zero()
        {
            return Err(anyhow!(
                "disk_health ticks and probe_interval must be greater than 0"
            ));
        }

        if !self.upload_delay.is_zero() && !self.writeback {
            warn!("upload_delay has no effect unless writeback is enabled");
        }
        if self.buffer_size < self.block_size {
            warn!(
                "buffer_size ({} bytes) is smaller than block_size ({} bytes)",
                self.buffer_size, self.block_size
            );
        }
        Ok(())
    }

    /// Whether a block of `size` bytes should be kept in the local cache.
    pub fn should_cache(&self, size: usize) -> bool {
        size < self.block_size || self.cache_full_block
    }
}

// Platform-specific module for detecting cgroup memory limits on Linux.
#[cfg(target_os = "linux")]
mod linux_memory {
    use super::*;

    pub fn get_cgroup_memory_limit() -> Option<u64> {
        // Cgroup v2
        if let Ok(limit_str) = fs::read_to_string("/sys/fs/cgroup/memory.max")
            && let Ok(limit) = limit_str.trim().parse::<u64>()
            && limit < u64::MAX / 2
        {
            info!("Detected cgroup v2 memory limit: {} bytes", limit);
            return Some(limit);
        }

        // Cgroup v1
        if let Ok(limit_str) = fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes")
            && let Ok(limit) = limit_str.trim().parse::<u64>()
            && limit < u64::MAX / 2
        {
            info!("Detected cgroup v1 memory limit: {} bytes", limit);
            return Some(limit);
        }

        None
    }
}

// Stub module for non-Linux operating systems.
#[cfg(not(target_os = "linux"))]
mod other_os_memory {
    pub fn get_cgroup_memory_limit() -> Option<u64> {
        None
    }
}

/// Gets the available memory, prioritizing cgroup limits on Linux over system memory.
fn get_available_memory() -> u64 {
    #[cfg(target_os = "linux")]
    let cgroup_limit = linux_memory::get_cgroup_memory_limit();

    #[cfg(not(target_os = "linux"))]
    let cgroup_limit = other_os_memory::get_cgroup_memory_limit();

    if let Some(limit) = cgroup_limit {
        return limit;
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let total_memory = sys.total_memory();
    warn!(
        "Could not detect cgroup memory limit. Using total system memory: {} bytes",
        total_memory
    );
    total_memory
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum SizeConfig {
    Bytes(u64),
    String(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeConfig::deserialize(deserializer)? {
        SizeConfig::Bytes(b) => Ok(b),
        SizeConfig::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_size_usize<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let size = deserialize_size(deserializer)?;
    usize::try_from(size).map_err(serde::de::Error::custom)
}

/// The `[chunk]` table as written in the file; `buffer_size` may be a percentage.
#[derive(Deserialize)]
struct RawChunkConfig {
    #[serde(default = "default_buffer_size_config")]
    buffer_size: SizeConfig,
    #[serde(flatten)]
    rest: ChunkConfig,
}

impl Default for RawChunkConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size_config(),
            rest: ChunkConfig::default(),
        }
    }
}

fn default_buffer_size_config() -> SizeConfig {
    SizeConfig::Bytes(default_buffer_size() as u64)
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    chunk: RawChunkConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            chunk: ChunkConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses, resolves and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw_config: RawConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        let mut chunk = raw_config.chunk.rest;
        chunk.buffer_size = resolve_buffer_size(raw_config.chunk.buffer_size)?;

        let config = Config {
            log_level: raw_config.log_level,
            storage: raw_config.storage,
            chunk,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        self.chunk.validate()?;
        if self.storage.kind == StorageKind::File && self.storage.path.trim().is_empty() {
            return Err(anyhow!("storage.path cannot be empty for file storage"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }
}

/// Resolves `buffer_size`, which may be a percentage of the available memory.
fn resolve_buffer_size(cfg: SizeConfig) -> Result<usize> {
    let bytes = match cfg {
        SizeConfig::Bytes(b) => b,
        SizeConfig::String(s) => {
            if let Some(percentage_str) = s.trim().strip_suffix('%') {
                let percentage: f64 = percentage_str
                    .trim()
                    .parse()
                    .context("Invalid buffer_size percentage value")?;
                if !(0.0..=100.0).contains(&percentage) {
                    return Err(anyhow!(
                        "Invalid buffer_size percentage, must be between 0 and 100"
                    ));
                }
                let available_memory = get_available_memory();
                let resolved = (available_memory as f64 * (percentage / 100.0)) as u64;
                info!(
                    "Resolved buffer_size '{}' to {} bytes ({:.2}% of total available {} bytes).",
                    s, resolved, percentage, available_memory
                );
                resolved
            } else {
                parse_size(&s)?
            }
        }
    };
    usize::try_from(bytes).map_err(|_| anyhow!("buffer_size {bytes} is too large"))
}

/// Parses a byte size such as `4096`, `64K`, `4MiB`, `512mb` or `1.5G`.
/// Units are powers of 1024.
pub fn parse_size(s: &str) -> Result<u64> {
    let lower = s.trim().to_lowercase();
    let trimmed = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);
    let (value_str, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        Some('t') => (&trimmed[..trimmed.len() - 1], 1u64 << 40),
        _ => (trimmed, 1u64),
    };
    let value_str = value_str.trim();
    if let Ok(value) = value_str.parse::<u64>() {
        return value
            .checked_mul(multiplier)
            .ok_or_else(|| anyhow!("size '{s}' is too large"));
    }
    let value: f64 = value_str.parse().with_context(|| {
        format!("Invalid size '{s}'. Must be a number of bytes or have a unit (e.g., '4M', '512kb').")
    })?;
    if value < 0.0 {
        return Err(anyhow!("size '{s}' cannot be negative"));
    }
    Ok((value * multiplier as f64) as u64)
}

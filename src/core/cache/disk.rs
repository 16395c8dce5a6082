// src/core/cache/disk.rs

//! One cache directory.
//!
//! Cached blocks live under `<dir>/raw/<key>` and write-back blocks under
//! `<dir>/rawstaging/<key>`. A staged block that should also be readable from the
//! cache is hard-linked into `raw/`; its index entry carries a negative size until
//! the upload completes, which keeps it away from every eviction policy.
//!
//! Blocks handed to [`DiskCacheShard::cache`] wait in memory on a bounded queue
//! until the flusher task writes them out. Reads consult that queue before the
//! disk, so a block is readable as soon as it is queued.

use super::eviction::{CacheItem, KeyIndex, new_key_index, now_secs};
use super::health::{DiskHealth, DiskProbe, DiskState};
use super::usage::{DiskUsage, disk_usage};
use super::{BlockKey, CacheReader, Uploader};
use crate::config::{ChecksumLevel, ChunkConfig, EvictionPolicy};
use crate::core::buffer::Page;
use crate::core::checksum::{CacheFile, checksum, trailer_len};
use crate::core::errors::{ChunkStoreError, Result};
use crate::core::metrics::{
    CACHE_DROPS, CACHE_EVICTS, CACHE_WRITE_BYTES, CACHE_WRITE_HIST, CACHE_WRITES,
    STAGING_BLOCK_BYTES, STAGING_BLOCKS,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CACHE_DIR: &str = "raw";
pub const STAGING_DIR: &str = "rawstaging";
const PROBE_DIR: &str = "probe";
const PROBE_DATA: [u8; 3] = [1, 2, 3];

/// Per-block accounting overhead for the inode.
const BLOCK_OVERHEAD: i64 = 4096;

/// Leftover temp files and empty directories older than this are removed by scans.
const STALE_AGE: Duration = Duration::from_secs(60);

/// A block waiting in memory to be written to the cache directory.
pub type PendingPage = (BlockKey, Page);

struct ShardState {
    keys: Box<dyn KeyIndex>,
    pages: HashMap<BlockKey, Page>,
    used: i64,
    scanned: bool,
}

impl ShardState {
    /// Records `key` in the index. `atime == 0` keeps the previous access time.
    fn index(&mut self, key: BlockKey, size: i32, atime: u32) {
        let previous = self.keys.peek(&key);
        if let Some(item) = previous
            && item.size > 0
        {
            self.used -= item.size as i64 + BLOCK_OVERHEAD;
        }
        let atime = if atime == 0 {
            previous.map(|item| item.atime).unwrap_or(0)
        } else {
            atime
        };
        self.keys.add(key, CacheItem::new(size, atime));
        if size > 0 {
            self.used += size as i64 + BLOCK_OVERHEAD;
        }
    }
}

/// A file found while walking a cache directory.
struct ScannedFile {
    path: PathBuf,
    key: BlockKey,
    size: u64,
    atime: u32,
    nlink: u64,
}

pub struct DiskCacheShard {
    dir: PathBuf,
    name: String,
    mode: u32,
    capacity: i64,
    free_ratio: f32,
    hash_prefix: bool,
    checksum: ChecksumLevel,
    fsync: bool,
    policy: EvictionPolicy,
    state: Mutex<ShardState>,
    pending: mpsc::Sender<PendingPage>,
    total_pages: AtomicI64,
    full: AtomicBool,
    health: Arc<DiskHealth>,
    uploader: Option<Uploader>,
    handle: Handle,
}

impl DiskCacheShard {
    /// Opens (creating if needed) the cache directory `dir` with `capacity` bytes.
    /// Returns the shard and the receiving end of its write queue, which the
    /// flusher task consumes.
    pub fn new(
        dir: PathBuf,
        capacity: i64,
        pending_pages: usize,
        config: &ChunkConfig,
        uploader: Option<Uploader>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PendingPage>)> {
        let handle = Handle::try_current()
            .map_err(|e| ChunkStoreError::Internal(format!("no tokio runtime: {e}")))?;
        create_dir(&dir, config.cache_mode)?;
        let (tx, rx) = mpsc::channel(pending_pages.max(1));
        let name = dir.display().to_string();
        let shard = Arc::new_cyclic(|me: &Weak<DiskCacheShard>| {
            let prober: Weak<dyn DiskProbe> = me.clone();
            DiskCacheShard {
                health: DiskHealth::new(
                    name.clone(),
                    config.disk_health.clone(),
                    prober,
                    handle.clone(),
                ),
                dir,
                name,
                mode: config.cache_mode,
                capacity,
                free_ratio: config.free_space_ratio,
                hash_prefix: config.hash_prefix,
                checksum: config.cache_checksum,
                fsync: config.writeback_fsync,
                policy: config.cache_eviction,
                state: Mutex::new(ShardState {
                    keys: new_key_index(config.cache_eviction, config.cache_expire),
                    pages: HashMap::new(),
                    used: 0,
                    scanned: false,
                }),
                pending: tx,
                total_pages: AtomicI64::new(0),
                full: AtomicBool::new(false),
                uploader,
                handle,
            }
        });
        shard.clear_probes();

        if let Some(usage) = disk_usage(&shard.dir) {
            let (br, fr) = usage.free_ratio();
            if br < shard.free_ratio || fr < shard.free_ratio {
                warn!(
                    "not enough space ({}%) or inodes ({}%) for caching in {}: free ratio should be >= {}%",
                    (br * 100.0) as i32,
                    (fr * 100.0) as i32,
                    shard.name,
                    (shard.free_ratio * 100.0) as i32
                );
            }
        }
        info!(
            "Disk cache ({}): capacity ({} MB), free ratio ({}%), max pending pages ({})",
            shard.name,
            capacity >> 20,
            (shard.free_ratio * 100.0) as i32,
            pending_pages.max(1)
        );
        Ok((shard, rx))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn health(&self) -> &Arc<DiskHealth> {
        &self.health
    }

    /// Whether the first scan of the directory has completed.
    pub fn is_scanned(&self) -> bool {
        self.state.lock().scanned
    }

    /// Whether free space is so low that staging is refused.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn cache_path(&self, key: &BlockKey) -> PathBuf {
        self.dir.join(CACHE_DIR).join(key.name(self.hash_prefix))
    }

    pub fn stage_path(&self, key: &BlockKey) -> PathBuf {
        self.dir.join(STAGING_DIR).join(key.name(self.hash_prefix))
    }

    /// `(blocks, bytes)`, counting blocks still waiting in memory once.
    pub fn stats(&self) -> (i64, i64) {
        let st = self.state.lock();
        let queued = st
            .pages
            .keys()
            .filter(|key| st.keys.peek(key).is_none())
            .count();
        (
            (queued + st.keys.len()) as i64,
            st.used + self.used_memory(),
        )
    }

    pub fn used_memory(&self) -> i64 {
        self.total_pages.load(Ordering::Acquire)
    }

    pub fn exists(&self, key: &BlockKey) -> bool {
        let st = self.state.lock();
        st.pages.contains_key(key) || st.keys.peek(key).is_some()
    }

    /// Queues `page` to be written under `key`.
    pub async fn cache(&self, key: &BlockKey, page: Page, force: bool) {
        if self.capacity == 0 {
            return;
        }
        if let Err(e) = self.health.check_op() {
            debug!("skip caching {} in {}: {}", key, self.name, e);
            return;
        }
        {
            let mut st = self.state.lock();
            if st.pages.contains_key(key) {
                return;
            }
            if self.policy == EvictionPolicy::None && st.used >= self.capacity {
                debug!(
                    "Caching directory is full ({}), drop {} ({} bytes)",
                    self.name,
                    key,
                    page.len()
                );
                CACHE_DROPS.inc();
                return;
            }
            st.pages.insert(*key, page.clone());
        }
        let len = page.len() as i64;
        self.total_pages.fetch_add(len, Ordering::AcqRel);
        match self.pending.try_send((*key, page)) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) if force => {
                if self.pending.send(item).await.is_err() {
                    self.forget_page(key, len);
                }
            }
            Err(TrySendError::Full(_)) => {
                debug!(
                    "Caching queue is full ({}), drop {} ({} bytes)",
                    self.name, key, len
                );
                CACHE_DROPS.inc();
                self.forget_page(key, len);
            }
            Err(TrySendError::Closed(_)) => self.forget_page(key, len),
        }
    }

    fn forget_page(&self, key: &BlockKey, len: i64) {
        if self.state.lock().pages.remove(key).is_some() {
            self.total_pages.fetch_sub(len, Ordering::AcqRel);
        }
    }

    /// Writes one queued block to disk. Called by the flusher task.
    pub async fn flush_pending(&self, key: BlockKey, page: Page) {
        let written = match self.health.check_op() {
            Ok(_guard) => {
                let started = Instant::now();
                let result = self
                    .flush_page(&self.cache_path(&key), page.as_slice(), false)
                    .await;
                self.health.record(started, &result);
                result.is_ok()
            }
            Err(_) => false,
        };
        // The page leaves memory in the same step as its key enters the index.
        let len = page.len() as i64;
        let over = {
            let mut st = self.state.lock();
            if st.pages.remove(&key).is_some() {
                self.total_pages.fetch_sub(len, Ordering::AcqRel);
            }
            if written {
                st.index(key, len as i32, now_secs());
            }
            written && st.used > self.capacity
        };
        if over {
            self.cleanup();
        }
    }

    pub async fn load(&self, key: &BlockKey) -> Result<CacheReader> {
        let _guard = self.health.check_op()?;
        {
            let st = self.state.lock();
            if let Some(page) = st.pages.get(key) {
                return Ok(CacheReader::Page(page.clone()));
            }
            if st.scanned && st.keys.peek(key).is_none() {
                return Err(ChunkStoreError::NotCached);
            }
        }
        let path = self.cache_path(key);
        let length = key.len();
        let level = self.checksum;
        let started = Instant::now();
        let opened = match tokio::task::spawn_blocking(move || CacheFile::open(&path, length, level))
            .await
        {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        };
        self.health.record(started, &opened);
        let file = opened?;
        self.state.lock().keys.get(key);
        Ok(CacheReader::File(Arc::new(file)))
    }

    /// Removes the cached copy of `key`, and the staged copy when `staging`. In the
    /// `down` state only the index is updated.
    pub async fn remove(&self, key: &BlockKey, staging: bool) {
        let known = {
            let mut st = self.state.lock();
            if let Some(page) = st.pages.remove(key) {
                self.total_pages
                    .fetch_sub(page.len() as i64, Ordering::AcqRel);
            }
            let removed = st.keys.remove(key, staging);
            if let Some(item) = removed
                && item.size > 0
            {
                st.used -= item.size as i64 + BLOCK_OVERHEAD;
            }
            removed.is_some() || !st.scanned
        };
        if self.health.state() == DiskState::Down {
            return;
        }
        if known {
            let _ = tokio::fs::remove_file(self.cache_path(key)).await;
        }
        if staging
            && let Ok(meta) = tokio::fs::metadata(self.stage_path(key)).await
            && tokio::fs::remove_file(self.stage_path(key)).await.is_ok()
        {
            STAGING_BLOCKS.dec();
            STAGING_BLOCK_BYTES.sub(meta.len() as f64);
        }
    }

    /// Writes a write-back block into the staging directory.
    pub async fn stage(&self, key: &BlockKey, data: &[u8], keep_cache: bool) -> Result<PathBuf> {
        let _guard = self.health.check_op()?;
        let path = self.stage_path(key);
        if self.is_full() {
            return Err(ChunkStoreError::NoSpace(self.name.clone()));
        }
        let started = Instant::now();
        let result = self.flush_page(&path, data, self.fsync).await;
        self.health.record(started, &result);
        result?;
        STAGING_BLOCKS.inc();
        STAGING_BLOCK_BYTES.add(data.len() as f64);

        if self.capacity > 0 && keep_cache {
            let cache_path = self.cache_path(key);
            if let Some(parent) = cache_path.parent() {
                let _ = create_dir(parent, self.mode);
            }
            let _ = tokio::fs::remove_file(&cache_path).await;
            match tokio::fs::hard_link(&path, &cache_path).await {
                Ok(()) => self.add(*key, -(data.len() as i32), now_secs()),
                Err(e) => warn!(
                    "link {} to {} failed: {}",
                    path.display(),
                    cache_path.display(),
                    e
                ),
            }
        }
        Ok(path)
    }

    /// Turns the staged entry of `key` into a regular cached block.
    pub fn uploaded(&self, key: &BlockKey, size: usize) {
        let over = {
            let mut st = self.state.lock();
            match st.keys.peek(key) {
                Some(item) if item.is_staging() => {
                    st.index(*key, size as i32, 0);
                    st.used > self.capacity
                }
                _ => false,
            }
        };
        STAGING_BLOCKS.dec();
        STAGING_BLOCK_BYTES.sub(size as f64);
        if over {
            self.cleanup();
        }
    }

    fn add(&self, key: BlockKey, size: i32, atime: u32) {
        let over = {
            let mut st = self.state.lock();
            st.index(key, size, atime);
            if st.used > self.capacity {
                debug!(
                    "Cleanup cache when add new data ({}): {} blocks ({} MB)",
                    self.name,
                    st.keys.len(),
                    st.used >> 20
                );
                true
            } else {
                false
            }
        };
        if over {
            self.cleanup();
        }
    }

    /// Evicts blocks until usage is back under 95% of the capacity, or further
    /// when the device is short of free space or inodes.
    fn cleanup(&self) {
        let mut todel = Vec::new();
        let mut freed = 0i64;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if !st.scanned {
                return;
            }
            let mut remaining = st.keys.len() as i64;
            let mut goal = self.capacity * 95 / 100;
            let mut num = remaining * 99 / 100;
            if let Some(usage) = disk_usage(&self.dir) {
                let (br, fr) = usage.free_ratio();
                if br < self.free_ratio {
                    let to_free = (usage.total as f32 * (self.free_ratio - br)) as i64;
                    if to_free > st.used {
                        goal = 0;
                    } else if st.used - to_free < goal {
                        goal = st.used - to_free;
                    }
                }
                if fr < self.free_ratio {
                    let to_free = (usage.files as f32 * (self.free_ratio - fr)) as i64;
                    num = if to_free > remaining { 0 } else { remaining - to_free };
                }
            }
            let now = now_secs();
            if let Some(candidates) = st.keys.eviction_iter() {
                for (key, item) in candidates {
                    let size = item.size as i64 + BLOCK_OVERHEAD;
                    st.used -= size;
                    freed += size;
                    remaining -= 1;
                    debug!(
                        "remove {} from cache, age: {}",
                        key,
                        now.saturating_sub(item.atime)
                    );
                    CACHE_EVICTS.inc();
                    todel.push(self.cache_path(&key));
                    if remaining < num && st.used < goal {
                        break;
                    }
                }
            }
            if !todel.is_empty() {
                debug!(
                    "cleanup cache ({}): {} blocks ({} MB), freed {} blocks ({} MB)",
                    self.name,
                    st.keys.len(),
                    st.used >> 20,
                    todel.len(),
                    freed >> 20
                );
            }
        }
        if !todel.is_empty() {
            self.handle.spawn_blocking(move || {
                for path in todel {
                    let _ = fs::remove_file(path);
                }
            });
        }
    }

    /// Re-evaluates free space: sets the `full` flag, evicts when below the floor
    /// and pushes staged blocks to upload when eviction alone is not enough.
    pub fn check_free_space(&self) {
        if self.health.state() == DiskState::Down {
            return;
        }
        let Some(usage) = disk_usage(&self.dir) else {
            return;
        };
        let (br, fr) = usage.free_ratio();
        self.full.store(
            br < self.free_ratio / 2.0 || fr < self.free_ratio / 2.0,
            Ordering::Release,
        );
        if br < self.free_ratio || fr < self.free_ratio {
            debug!(
                "Cleanup cache when check free space ({}): free ratio ({}%), space usage ({}%), inodes usage ({}%)",
                self.name,
                (self.free_ratio * 100.0) as i32,
                (br * 100.0) as i32,
                (fr * 100.0) as i32
            );
            self.cleanup();
            if let Some(usage) = disk_usage(&self.dir) {
                let (br, fr) = usage.free_ratio();
                if br < self.free_ratio || fr < self.free_ratio {
                    self.upload_staging(&usage);
                }
            }
        }
    }

    /// Hands staged blocks to the uploader, oldest (by minute) and largest first,
    /// until enough space would be reclaimed.
    fn upload_staging(&self, usage: &DiskUsage) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        let mut staged: Vec<(BlockKey, CacheItem)> = {
            let st = self.state.lock();
            if !st.scanned {
                return;
            }
            st.keys
                .random_iter()
                .filter(|(_, item)| item.is_staging())
                .collect()
        };
        staged.sort_by_key(|(_, item)| (item.atime / 60, item.size));

        let (br, fr) = usage.free_ratio();
        let mut to_free = (usage.total as f64 * (self.free_ratio - br.min(fr)) as f64) as i64;
        let now = now_secs();
        for (key, item) in staged {
            uploader(key, self.stage_path(&key), true);
            debug!("upload {}, age: {}", key, now.saturating_sub(item.atime));
            to_free -= -(item.size as i64) + BLOCK_OVERHEAD;
            if to_free < 0 {
                break;
            }
        }
    }

    /// Rebuilds the index from the files under `raw/`.
    pub async fn scan_cached(&self) {
        if self.health.state() == DiskState::Down {
            return;
        }
        let root = self.dir.join(CACHE_DIR);
        let start = Instant::now();
        let start_secs = now_secs();
        debug!("Scan {} to find cached blocks", root.display());
        let found = match tokio::task::spawn_blocking(move || scan_dir(&root, true)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("scan of {} failed: {}", self.name, e);
                return;
            }
        };

        let mut misfit = Vec::new();
        let over = {
            let mut st = self.state.lock();
            let old = st.keys.reset();
            st.used = 0;
            for file in found {
                let len = file.key.len() as u64;
                if file.size != len && file.size != len + trailer_len(file.key.len()) as u64 {
                    misfit.push(file.path);
                    continue;
                }
                let atime = file.atime.max(old.peek_atime(&file.key));
                if file.nlink > 1 {
                    st.index(file.key, -(len as i32), atime);
                } else {
                    st.index(file.key, len as i32, atime);
                }
            }
            // Blocks written while the walk was running.
            for (key, item) in old.random_iter() {
                if item.atime >= start_secs && st.keys.peek(&key).is_none() {
                    st.index(key, item.size, item.atime);
                }
            }
            st.scanned = true;
            debug!(
                "Found {} cached blocks ({} bytes) in {} with {:?}",
                st.keys.len(),
                st.used,
                self.name,
                start.elapsed()
            );
            st.used > self.capacity
        };
        for path in misfit {
            debug!("remove cached file with unexpected size: {}", path.display());
            let _ = tokio::fs::remove_file(path).await;
        }
        if over {
            self.cleanup();
        }
    }

    /// Hands every block left in `rawstaging/` by a previous run to the uploader.
    pub async fn scan_staging(&self) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        if self.health.state() == DiskState::Down {
            return;
        }
        let root = self.dir.join(STAGING_DIR);
        let start = Instant::now();
        debug!("Scan {} to find staging blocks", root.display());
        let found = match tokio::task::spawn_blocking(move || scan_dir(&root, false)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("staging scan of {} failed: {}", self.name, e);
                return;
            }
        };
        let mut bytes = 0u64;
        let count = found.len();
        for file in found {
            debug!("Found staging block: {}", file.path.display());
            bytes += file.size;
            STAGING_BLOCKS.inc();
            STAGING_BLOCK_BYTES.add(file.key.len() as f64);
            uploader(file.key, file.path, false);
        }
        if count > 0 {
            info!(
                "Found {} staging blocks ({} bytes) in {} with {:?}",
                count,
                bytes,
                self.name,
                start.elapsed()
            );
        }
    }

    /// Writes `data` (plus its checksum trailer) to `path` through a temp file.
    async fn flush_page(&self, path: &Path, data: &[u8], sync: bool) -> Result<()> {
        let start = Instant::now();
        CACHE_WRITES.inc();
        CACHE_WRITE_BYTES.inc_by(data.len() as f64);
        let tmp = tmp_path(path);
        let result = self.write_file(&tmp, path, data, sync).await;
        if let Err(e) = &result {
            warn!("Write to cache file {} failed: {}", tmp.display(), e);
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        CACHE_WRITE_HIST.observe(start.elapsed().as_secs_f64());
        result
    }

    async fn write_file(&self, tmp: &Path, path: &Path, data: &[u8], sync: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(dir_mode(self.mode))
                .create(parent)
                .await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.mode)
            .open(tmp)
            .await?;
        file.write_all(data).await?;
        if self.checksum != ChecksumLevel::None {
            file.write_all(&checksum(data)).await?;
        }
        if sync {
            file.sync_all().await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(tmp, path).await?;
        Ok(())
    }
}

impl DiskProbe for DiskCacheShard {
    fn probe(&self, seq: u64) -> Result<()> {
        let key = format!(
            "{:02X}/{}/{}_0_{}",
            seq % 256,
            seq / 1_000_000,
            seq,
            PROBE_DATA.len()
        );
        let path = self.dir.join(CACHE_DIR).join(PROBE_DIR).join(key);
        if let Some(parent) = path.parent() {
            create_dir(parent, self.mode)?;
        }
        fs::write(&path, PROBE_DATA)?;
        let back = fs::read(&path);
        let _ = fs::remove_file(&path);
        if back? != PROBE_DATA {
            return Err(ChunkStoreError::Internal(format!(
                "probe {} read back different data",
                path.display()
            )));
        }
        Ok(())
    }

    fn clear_probes(&self) {
        let _ = fs::remove_dir_all(self.dir.join(CACHE_DIR).join(PROBE_DIR));
    }
}

/// Directories get search permission wherever the file mode grants read.
fn dir_mode(mode: u32) -> u32 {
    let read = mode & 0o444;
    mode | (read >> 2) | (read >> 1)
}

fn create_dir(dir: &Path, mode: u32) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(dir_mode(mode))
        .create(dir)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn is_stale(meta: &fs::Metadata) -> bool {
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|age| age > STALE_AGE)
}

/// Walks `root` collecting block files. Stale temp files and empty directories are
/// removed on the way; with `skip_probes`, the probe directory is left alone.
fn scan_dir(root: &Path, skip_probes: bool) -> Vec<ScannedFile> {
    let mut found = Vec::new();
    walk(root, root, skip_probes, &mut found);
    found
}

fn walk(root: &Path, dir: &Path, skip_probes: bool, found: &mut Vec<ScannedFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            if skip_probes && dir == root && entry.file_name() == PROBE_DIR {
                continue;
            }
            walk(root, &path, skip_probes, found);
            if is_stale(&meta) && fs::remove_dir(&path).is_ok() {
                debug!("Remove empty directory: {}", path.display());
            }
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "tmp") {
            if is_stale(&meta) && fs::remove_file(&path).is_ok() {
                debug!("Remove stale temp file: {}", path.display());
            }
            continue;
        }
        let Some(key) = path.to_str().and_then(BlockKey::parse) else {
            continue;
        };
        found.push(ScannedFile {
            path,
            key,
            size: meta.len(),
            atime: meta.atime().max(0) as u32,
            nlink: meta.nlink(),
        });
    }
}

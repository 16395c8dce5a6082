// tests/integration/eviction_scenario_test.rs

//! End-to-end eviction scenarios on real cache directories and the memory cache.

use super::test_helpers::{init_tracing, wait_until};
use chunkstore::config::{ChunkConfig, EvictionPolicy};
use chunkstore::core::buffer::Page;
use chunkstore::core::cache::eviction::{CacheItem, KeyIndex, RandomEviction};
use chunkstore::core::cache::{BlockKey, CacheManager, DiskCacheManager, DiskCacheShard, MemCache};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const SMALL: usize = 64 << 10;
/// Accounted size of one cached block, including the inode overhead.
const ACCOUNTED: u64 = SMALL as u64 + 4096;

fn disk_config(dir: &TempDir, policy: EvictionPolicy, blocks: u64) -> ChunkConfig {
    ChunkConfig {
        cache_dir: dir.path().to_string_lossy().into_owned(),
        cache_size: blocks * ACCOUNTED,
        cache_eviction: policy,
        block_size: SMALL,
        free_space_ratio: 0.0,
        buffer_size: 64 << 20,
        ..ChunkConfig::default()
    }
}

async fn open_single(config: &ChunkConfig) -> (DiskCacheManager, broadcast::Sender<()>) {
    init_tracing();
    let (shutdown_tx, _) = broadcast::channel(1);
    let manager = DiskCacheManager::new(config, None, &shutdown_tx).unwrap();
    let shard = manager.shards()[0].clone();
    assert!(wait_until(Duration::from_secs(5), || shard.is_scanned()).await);
    (manager, shutdown_tx)
}

fn block(seed: u8) -> Page {
    Page::new(vec![seed; SMALL])
}

async fn settle(shard: &Arc<DiskCacheShard>) {
    let shard = shard.clone();
    assert!(wait_until(Duration::from_secs(5), || shard.used_memory() == 0).await);
}

#[tokio::test]
async fn test_lru_keeps_cache_within_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir, EvictionPolicy::Lru, 8);
    let (manager, shutdown_tx) = open_single(&config).await;
    let shard = manager.shards()[0].clone();

    for id in 1..=20u64 {
        manager
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), true)
            .await;
    }
    settle(&shard).await;

    let (blocks, bytes) = manager.stats();
    assert!(bytes <= config.cache_size as i64, "{bytes} bytes cached");
    assert!(blocks < 20 && blocks > 0);
    // Oldest out first, newest stays.
    assert!(!manager.exists(&BlockKey::new(1, 0, SMALL as u32)));
    assert!(manager.exists(&BlockKey::new(20, 0, SMALL as u32)));
    let evicted = shard.cache_path(&BlockKey::new(1, 0, SMALL as u32));
    assert!(wait_until(Duration::from_secs(5), || !evicted.exists()).await);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_none_policy_drops_new_blocks_when_full() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir, EvictionPolicy::None, 4);
    let (manager, shutdown_tx) = open_single(&config).await;
    let shard = manager.shards()[0].clone();

    for id in 1..=4u64 {
        manager
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), true)
            .await;
        settle(&shard).await;
    }
    for id in 5..=8u64 {
        manager
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), true)
            .await;
    }
    settle(&shard).await;

    for id in 1..=4u64 {
        assert!(manager.exists(&BlockKey::new(id, 0, SMALL as u32)), "block {id}");
    }
    for id in 5..=8u64 {
        assert!(!manager.exists(&BlockKey::new(id, 0, SMALL as u32)), "block {id}");
    }
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_staged_blocks_are_never_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir, EvictionPolicy::TwoRandom, 4);
    let (manager, shutdown_tx) = open_single(&config).await;
    let shard = manager.shards()[0].clone();

    let staged: Vec<BlockKey> = (100..103u64)
        .map(|id| BlockKey::new(id, 0, SMALL as u32))
        .collect();
    for key in &staged {
        manager.stage(key, &vec![7u8; SMALL], true).await.unwrap();
    }
    for id in 1..=16u64 {
        manager
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), true)
            .await;
    }
    settle(&shard).await;

    for key in &staged {
        assert!(manager.exists(key));
        assert!(shard.cache_path(key).exists());
        assert!(shard.stage_path(key).exists());
    }
    let (_, bytes) = manager.stats();
    assert!(bytes <= config.cache_size as i64);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_uploaded_block_becomes_evictable() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir, EvictionPolicy::Lru, 4);
    let (manager, shutdown_tx) = open_single(&config).await;
    let shard = manager.shards()[0].clone();

    // Lowest id, so it loses every tie on access time.
    let key = BlockKey::new(0, 0, SMALL as u32);
    let staged_path = manager.stage(&key, &vec![9u8; SMALL], true).await.unwrap();
    manager.uploaded(&key, SMALL);
    std::fs::remove_file(staged_path).unwrap();

    for id in 1..=12u64 {
        manager
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), true)
            .await;
    }
    settle(&shard).await;
    assert!(!manager.exists(&key));
    let _ = shutdown_tx.send(());
}

const TINY: usize = 1024;
const MIB: i64 = 1 << 20;

#[tokio::test]
async fn test_two_random_keeps_thousands_of_blocks_within_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let config = ChunkConfig {
        cache_dir: dir.path().to_string_lossy().into_owned(),
        cache_size: MIB as u64,
        cache_eviction: EvictionPolicy::TwoRandom,
        block_size: TINY,
        free_space_ratio: 0.0,
        buffer_size: 64 << 20,
        ..ChunkConfig::default()
    };
    let (manager, shutdown_tx) = open_single(&config).await;
    let shard = manager.shards()[0].clone();

    for id in 1..=2000u64 {
        manager
            .cache(&BlockKey::new(id, 0, TINY as u32), Page::new(vec![id as u8; TINY]), true)
            .await;
    }
    settle(&shard).await;

    let (blocks, bytes) = manager.stats();
    assert!(bytes <= MIB, "{bytes} bytes cached");
    assert!(blocks > 0 && blocks < 2000);
    let _ = shutdown_tx.send(());
}

#[test]
fn test_two_random_never_evicts_the_newer_of_a_pair() {
    // Same accounting as a disk shard: block size plus the inode overhead.
    let cost = TINY as i64 + 4096;
    let mut index = RandomEviction::new(Duration::ZERO);
    index.record_pairs();
    let mut used = 0i64;
    let mut evicted = 0usize;

    for id in 1..=2000u64 {
        // Access times jump around so pairs often meet an older later insert.
        let atime = 1_000_000 + ((id * 7919) % 2000) as u32;
        index.add(BlockKey::new(id, 0, TINY as u32), CacheItem::new(TINY as i32, atime));
        used += cost;
        if used > MIB {
            let goal = MIB * 95 / 100;
            let candidates = index.eviction_iter().expect("2-random evicts");
            for (_, item) in candidates {
                used -= item.size as i64 + 4096;
                evicted += 1;
                if used < goal {
                    break;
                }
            }
        }
        assert!(used <= MIB);
    }

    let pairs = index.take_pairs();
    assert!(!pairs.is_empty());
    assert!(pairs.len() <= evicted);
    for (victim, kept) in &pairs {
        assert!(
            victim.atime <= kept.atime,
            "evicted atime {} while its peer had {}",
            victim.atime,
            kept.atime
        );
    }
    assert_eq!(index.len(), 2000 - evicted);
    assert!(index.take_pairs().is_empty());
}

#[tokio::test]
async fn test_memory_cache_lru_eviction() {
    let cache = MemCache::new(&ChunkConfig {
        cache_size: 10 * SMALL as u64,
        cache_eviction: EvictionPolicy::Lru,
        ..ChunkConfig::default()
    });
    for id in 1..=30u64 {
        cache
            .cache(&BlockKey::new(id, 0, SMALL as u32), block(id as u8), false)
            .await;
    }
    let (blocks, bytes) = cache.stats();
    assert!(bytes <= cache.capacity());
    assert!(blocks <= 10);
    assert!(cache.exists(&BlockKey::new(30, 0, SMALL as u32)));
    assert!(!cache.exists(&BlockKey::new(1, 0, SMALL as u32)));
    assert!(cache.load(&BlockKey::new(1, 0, SMALL as u32)).await.is_err());
}

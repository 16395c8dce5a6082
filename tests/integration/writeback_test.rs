// tests/integration/writeback_test.rs

//! Integration tests for write-back: staging on local disk, immediate and delayed
//! uploads, removal of staged blocks, and recovery of staged blocks on restart.

use super::test_helpers::{BLOCK, TestStore, init_tracing, pattern, test_config, wait_until};
use chunkstore::config::ChunkConfig;
use chunkstore::core::cache::BlockKey;
use chunkstore::core::object::{MemStorage, ObjectStorage};
use chunkstore::core::store::{CachedStore, ChunkStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn writeback_config(upload_delay: Duration) -> ChunkConfig {
    ChunkConfig {
        writeback: true,
        upload_delay,
        ..test_config()
    }
}

fn staged(dir: &Path, name: &str) -> PathBuf {
    dir.join("rawstaging").join(name)
}

fn cached(dir: &Path, name: &str) -> PathBuf {
    dir.join("raw").join(name)
}

#[tokio::test]
async fn test_writeback_uploads_immediately_without_delay() {
    let ctx = TestStore::on_disk(writeback_config(Duration::ZERO)).await;
    let len = BLOCK + 100;
    let data = pattern(len, 30);
    ctx.write_chunk(30, &data).await.unwrap();

    let storage = ctx.storage.clone();
    let store = ctx.store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            storage.len() == 2 && store.pending_uploads() == 0
        })
        .await
    );
    let stage0 = staged(ctx.cache_dir(), &ctx.object_key(30, 0, len));
    assert!(wait_until(Duration::from_secs(5), || !stage0.exists()).await);

    assert_eq!(ctx.read_chunk(30, len, 0, len).await.unwrap(), data);
}

#[tokio::test]
async fn test_writeback_delays_upload() {
    let ctx = TestStore::on_disk(writeback_config(Duration::from_secs(1))).await;
    let data = pattern(1000, 31);
    ctx.write_chunk(31, &data).await.unwrap();

    let name = ctx.object_key(31, 0, 1000);
    let stage = staged(ctx.cache_dir(), &name);
    let cache = cached(ctx.cache_dir(), &name);
    assert!(stage.exists(), "block should be staged");
    assert!(cache.exists(), "staged block should be linked into the cache");
    assert!(!ctx.storage.contains(&name));
    assert!(ctx.store.is_pending(&BlockKey::new(31, 0, 1000)));

    // Readable from the staged copy before the upload.
    assert_eq!(ctx.read_chunk(31, 1000, 0, 1000).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 0);

    let storage = ctx.storage.clone();
    let store = ctx.store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            storage.contains(&name) && store.pending_uploads() == 0
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(5), || !stage.exists()).await);
    assert!(cache.exists(), "uploaded block stays cached");

    let stored = ctx.storage.get(&name, 0, -1).await.unwrap();
    assert_eq!(stored.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_remove_before_delayed_upload() {
    let ctx = TestStore::on_disk(writeback_config(Duration::from_secs(10))).await;
    let data = pattern(2000, 32);
    ctx.write_chunk(32, &data).await.unwrap();
    let name = ctx.object_key(32, 0, 2000);
    assert!(staged(ctx.cache_dir(), &name).exists());

    ctx.store.remove(32, 2000).await.unwrap();
    assert_eq!(ctx.store.pending_uploads(), 0);
    assert!(!staged(ctx.cache_dir(), &name).exists());
    assert!(!cached(ctx.cache_dir(), &name).exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ctx.storage.is_empty());
}

#[tokio::test]
async fn test_remove_during_upload_leaves_no_object() {
    let ctx = TestStore::on_disk(writeback_config(Duration::ZERO)).await;
    ctx.storage.set_put_delay(Duration::from_millis(500));
    let data = pattern(2500, 38);
    ctx.write_chunk(38, &data).await.unwrap();
    let name = ctx.object_key(38, 0, 2500);

    let storage = ctx.storage.clone();
    assert!(wait_until(Duration::from_secs(5), || storage.put_count() == 1).await);
    ctx.store.remove(38, 2500).await.unwrap();
    assert!(!staged(ctx.cache_dir(), &name).exists());

    // The late PUT is followed by a second DELETE.
    assert!(wait_until(Duration::from_secs(5), || storage.delete_count() == 2).await);
    assert!(ctx.storage.is_empty());
    assert_eq!(ctx.store.pending_uploads(), 0);
}

#[tokio::test]
async fn test_full_blocks_are_not_kept_without_cache_full_block() {
    let ctx = TestStore::on_disk(ChunkConfig {
        cache_full_block: false,
        ..writeback_config(Duration::from_secs(10))
    })
    .await;
    let len = BLOCK + 10;
    ctx.write_chunk(33, &pattern(len, 33)).await.unwrap();

    let full = ctx.object_key(33, 0, len);
    let tail = ctx.object_key(33, 1, len);
    assert!(staged(ctx.cache_dir(), &full).exists());
    assert!(!cached(ctx.cache_dir(), &full).exists());
    assert!(cached(ctx.cache_dir(), &tail).exists());
}

#[tokio::test]
async fn test_writeback_with_memory_cache_uploads_directly() {
    let ctx = TestStore::with_config(writeback_config(Duration::ZERO)).await;
    let data = pattern(500, 34);
    ctx.write_chunk(34, &data).await.unwrap();
    assert!(ctx.storage.contains(&ctx.object_key(34, 0, 500)));
}

#[tokio::test]
async fn test_failed_staged_upload_is_retried_later() {
    let ctx = TestStore::on_disk(ChunkConfig {
        max_retries: 0,
        ..writeback_config(Duration::ZERO)
    })
    .await;
    ctx.storage.fail_next_puts(1);
    let data = pattern(700, 35);
    // Acknowledged once staged, whatever the upload does.
    ctx.write_chunk(35, &data).await.unwrap();

    let name = ctx.object_key(35, 0, 700);
    let storage = ctx.storage.clone();
    let store = ctx.store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            storage.contains(&name) && store.pending_uploads() == 0
        })
        .await
    );
    assert!(ctx.storage.put_count() >= 2);
}

#[tokio::test]
async fn test_staged_blocks_survive_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = ChunkConfig {
        cache_dir: dir.path().to_string_lossy().into_owned(),
        ..writeback_config(Duration::from_secs(3600))
    };
    let data = pattern(1500, 36);
    let name = "chunks/0/0/36_0_1500";

    let first = Arc::new(MemStorage::new());
    {
        let store = CachedStore::new(first.clone() as Arc<dyn ObjectStorage>, config.clone()).unwrap();
        let mut writer = store.new_writer(36);
        writer.write_at(&data, 0).unwrap();
        writer.finish(data.len()).await.unwrap();
        store.shutdown();
    }
    assert!(first.is_empty());
    assert!(staged(dir.path(), name).exists());

    let second = Arc::new(MemStorage::new());
    let store = CachedStore::new(
        second.clone() as Arc<dyn ObjectStorage>,
        ChunkConfig {
            upload_delay: Duration::ZERO,
            ..config
        },
    )
    .unwrap();
    let storage = second.clone();
    assert!(wait_until(Duration::from_secs(5), || storage.contains(name)).await);
    let stored = second.get(name, 0, -1).await.unwrap();
    assert_eq!(stored.as_ref(), data.as_slice());
    store.shutdown();
}

#[tokio::test]
async fn test_leftover_staging_file_is_uploaded_on_startup() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(2000, 37);
    let name = "chunks/0/0/37_0_2000";
    let path = staged(dir.path(), name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, &data).unwrap();

    let storage = Arc::new(MemStorage::new());
    let config = ChunkConfig {
        cache_dir: dir.path().to_string_lossy().into_owned(),
        cache_checksum: chunkstore::config::ChecksumLevel::None,
        ..writeback_config(Duration::ZERO)
    };
    let store = CachedStore::new(storage.clone() as Arc<dyn ObjectStorage>, config).unwrap();
    let probe = storage.clone();
    assert!(wait_until(Duration::from_secs(5), || probe.contains(name)).await);
    let stored = tokio_test::assert_ok!(storage.get(name, 0, -1).await);
    assert_eq!(stored.as_ref(), data.as_slice());
    assert!(wait_until(Duration::from_secs(5), || !path.exists()).await);
    store.shutdown();
}

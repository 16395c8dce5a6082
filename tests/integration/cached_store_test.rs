// tests/integration/cached_store_test.rs

//! Integration tests for the chunk store: write, read, remove and cache warmup
//! against an in-memory object storage.

use super::test_helpers::{BLOCK, TestStore, pattern, test_config, wait_until};
use bytes::Bytes;
use chunkstore::config::{ChunkConfig, CompressAlgorithm};
use chunkstore::core::errors::ChunkStoreError;
use chunkstore::core::object::{MemStorage, ObjectStorage};
use chunkstore::core::store::{CHUNK_SIZE, CachedStore, ChunkStore};
use std::sync::Arc;
use std::time::Duration;

// ===== Write / Read =====

#[tokio::test]
async fn test_write_read_multiple_blocks() {
    let ctx = TestStore::new().await;
    let len = BLOCK * 2 + BLOCK / 2;
    let data = pattern(len, 1);
    ctx.write_chunk(1, &data).await.unwrap();

    assert_eq!(
        ctx.storage.keys(),
        vec![
            ctx.object_key(1, 0, len),
            ctx.object_key(1, 1, len),
            ctx.object_key(1, 2, len),
        ]
    );
    assert_eq!(ctx.object_key(1, 2, len), format!("chunks/0/0/1_2_{}", BLOCK / 2));

    let back = ctx.read_chunk(1, len, 0, len).await.unwrap();
    assert_eq!(back, data);
}

#[tokio::test]
async fn test_block_buffers_are_recycled() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        ..test_config()
    })
    .await;
    let pool = ctx.store.block_pool().clone();
    assert_eq!(pool.page_size(), BLOCK);

    let len = BLOCK * 3;
    for id in 40..43 {
        ctx.write_chunk(id, &pattern(len, id as u8)).await.unwrap();
    }
    assert!(pool.idle() >= 1, "no block buffer returned to the pool");
    assert_eq!(ctx.read_chunk(41, len, 0, len).await.unwrap(), pattern(len, 41));
}

#[tokio::test]
async fn test_compressed_loads_use_pooled_buffers() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        compress: CompressAlgorithm::Lz4,
        ..test_config()
    })
    .await;
    let data = pattern(BLOCK * 2, 44);
    ctx.write_chunk(44, &data).await.unwrap();
    let pool = ctx.store.block_pool().clone();
    let before = pool.idle();
    assert!(before >= 1);

    // Each block is decompressed into a buffer taken from the pool and given back.
    assert_eq!(ctx.read_chunk(44, data.len(), 0, data.len()).await.unwrap(), data);
    assert_eq!(pool.idle(), before);
}

#[tokio::test]
async fn test_read_across_block_boundary() {
    let ctx = TestStore::new().await;
    let len = BLOCK * 2;
    let data = pattern(len, 2);
    ctx.write_chunk(2, &data).await.unwrap();

    let off = BLOCK - 100;
    let back = ctx.read_chunk(2, len, off, 300).await.unwrap();
    assert_eq!(back, &data[off..off + 300]);
}

#[tokio::test]
async fn test_read_past_end_is_short() {
    let ctx = TestStore::new().await;
    let data = pattern(1000, 3);
    ctx.write_chunk(3, &data).await.unwrap();

    let back = ctx.read_chunk(3, 1000, 900, 500).await.unwrap();
    assert_eq!(back, &data[900..]);
    let back = ctx.read_chunk(3, 1000, 1000, 10).await.unwrap();
    assert!(back.is_empty());
}

#[tokio::test]
async fn test_read_after_evict_fetches_from_storage() {
    let ctx = TestStore::new().await;
    let len = BLOCK + 10;
    let data = pattern(len, 4);
    ctx.write_chunk(4, &data).await.unwrap();

    // Served from the cache filled by the upload.
    assert_eq!(ctx.read_chunk(4, len, 0, len).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 0);

    ctx.store.evict_cache(4, len).await.unwrap();
    assert_eq!(ctx.read_chunk(4, len, 0, len).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 2);

    // And cached again.
    assert_eq!(ctx.read_chunk(4, len, 0, len).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 2);
}

#[tokio::test]
async fn test_small_range_read_without_cache() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        ..test_config()
    })
    .await;
    let data = pattern(BLOCK, 5);
    ctx.write_chunk(5, &data).await.unwrap();

    let back = ctx.read_chunk(5, BLOCK, 1000, 100).await.unwrap();
    assert_eq!(back, &data[1000..1100]);
    let back = ctx.read_chunk(5, BLOCK, 0, BLOCK).await.unwrap();
    assert_eq!(back, data);
}

#[tokio::test]
async fn test_compressed_blocks_roundtrip() {
    for algo in [CompressAlgorithm::Zstd, CompressAlgorithm::Lz4] {
        let ctx = TestStore::with_config(ChunkConfig {
            compress: algo,
            ..test_config()
        })
        .await;
        let len = BLOCK + 4096;
        // Compressible: long runs.
        let data: Vec<u8> = (0..len).map(|i| (i / 1024) as u8).collect();
        ctx.write_chunk(6, &data).await.unwrap();

        let key = ctx.object_key(6, 0, len);
        let stored = ctx.storage.get(&key, 0, -1).await.unwrap();
        assert!(stored.len() < BLOCK, "{algo} did not compress");

        ctx.store.evict_cache(6, len).await.unwrap();
        let back = ctx.read_chunk(6, len, 0, len).await.unwrap();
        assert_eq!(back, data, "{algo} roundtrip");
        // Ranged reads of compressed objects go through whole blocks.
        let back = ctx.read_chunk(6, len, 500, 20).await.unwrap();
        assert_eq!(back, &data[500..520]);
    }
}

#[tokio::test]
async fn test_corrupt_object_is_reported() {
    let ctx = TestStore::new().await;
    let data = pattern(1000, 7);
    ctx.write_chunk(7, &data).await.unwrap();
    ctx.store.evict_cache(7, 1000).await.unwrap();

    let key = ctx.object_key(7, 0, 1000);
    ctx.storage.put(&key, Bytes::from_static(b"short")).await.unwrap();
    let err = ctx.read_chunk(7, 1000, 0, 1000).await.unwrap_err();
    assert!(matches!(
        err,
        ChunkStoreError::LengthMismatch {
            expected: 1000,
            actual: 5
        }
    ));
}

// ===== Writer contract =====

#[tokio::test]
async fn test_write_gap_is_zero_filled() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(8);
    writer.write_at(b"head", 0).unwrap();
    writer.write_at(b"tail", BLOCK + 100).unwrap();
    let len = BLOCK + 104;
    assert_eq!(writer.len(), len);
    writer.finish(len).await.unwrap();

    let back = ctx.read_chunk(8, len, 0, len).await.unwrap();
    assert_eq!(&back[..4], b"head");
    assert!(back[4..BLOCK + 100].iter().all(|&b| b == 0));
    assert_eq!(&back[BLOCK + 100..], b"tail");
}

#[tokio::test]
async fn test_overwrite_before_flush() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(9);
    writer.write_at(&[1u8; 300], 0).unwrap();
    writer.write_at(&[2u8; 100], 100).unwrap();
    writer.finish(300).await.unwrap();

    let back = ctx.read_chunk(9, 300, 0, 300).await.unwrap();
    assert!(back[..100].iter().all(|&b| b == 1));
    assert!(back[100..200].iter().all(|&b| b == 2));
    assert!(back[200..].iter().all(|&b| b == 1));
}

#[tokio::test]
async fn test_write_out_of_chunk_boundary() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(10);
    let err = writer.write_at(b"x", CHUNK_SIZE).unwrap_err();
    assert!(matches!(err, ChunkStoreError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_store_rejects_invalid_block_size() {
    for block_size in [0, 3 << 20] {
        let config = ChunkConfig {
            block_size,
            ..test_config()
        };
        let storage = Arc::new(MemStorage::new());
        let err = CachedStore::new(storage as Arc<dyn ObjectStorage>, config)
            .err()
            .expect("block size should be rejected");
        assert!(
            matches!(&err, ChunkStoreError::InvalidArgument(msg) if msg.contains("block_size")),
            "unexpected error: {err}"
        );
    }
}

#[tokio::test]
async fn test_write_below_upload_watermark() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(11);
    writer.write_at(&pattern(BLOCK * 2, 11), 0).unwrap();
    writer.flush_to(BLOCK).unwrap();

    let err = writer.write_at(b"late", 10).unwrap_err();
    assert!(matches!(err, ChunkStoreError::InvalidArgument(_)));
    let err = writer.flush_to(10).unwrap_err();
    assert!(matches!(err, ChunkStoreError::InvalidArgument(_)));

    // Writes after the watermark are still fine.
    writer.write_at(b"ok", BLOCK + 1).unwrap();
    writer.finish(BLOCK * 2).await.unwrap();
}

#[tokio::test]
async fn test_flush_to_uploads_complete_blocks() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(12);
    let len = BLOCK * 2 + 10;
    writer.write_at(&pattern(len, 12), 0).unwrap();
    writer.flush_to(BLOCK * 2).unwrap();

    let storage = ctx.storage.clone();
    assert!(wait_until(Duration::from_secs(5), || storage.len() == 2).await);
    writer.finish(len).await.unwrap();
    assert_eq!(ctx.storage.len(), 3);
}

#[tokio::test]
async fn test_finish_with_wrong_length() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(13);
    writer.write_at(b"abc", 0).unwrap();
    let err = writer.finish(4).await.unwrap_err();
    assert!(matches!(
        err,
        ChunkStoreError::LengthMismatch {
            expected: 3,
            actual: 4
        }
    ));
    assert!(ctx.storage.is_empty());
}

#[tokio::test]
async fn test_abort_discards_buffered_data() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(14);
    writer.write_at(&pattern(1000, 14), 0).unwrap();
    writer.abort();
    assert!(writer.is_empty());
    writer.finish(0).await.unwrap();
    assert!(ctx.storage.is_empty());
}

#[tokio::test]
async fn test_set_id_before_upload() {
    let ctx = TestStore::new().await;
    let mut writer = ctx.store.new_writer(0);
    writer.write_at(b"renamed", 0).unwrap();
    writer.set_id(15);
    assert_eq!(writer.id(), 15);
    writer.finish(7).await.unwrap();
    assert!(ctx.storage.contains("chunks/0/0/15_0_7"));
}

// ===== Upload retries =====

#[tokio::test]
async fn test_upload_retries_transient_failure() {
    let ctx = TestStore::new().await;
    ctx.storage.fail_next_puts(1);
    let data = pattern(500, 16);
    ctx.write_chunk(16, &data).await.unwrap();
    assert_eq!(ctx.storage.put_count(), 2);
    assert!(ctx.storage.contains(&ctx.object_key(16, 0, 500)));
}

#[tokio::test]
async fn test_upload_gives_up_after_max_retries() {
    let ctx = TestStore::with_config(ChunkConfig {
        max_retries: 0,
        ..test_config()
    })
    .await;
    ctx.storage.fail_next_puts(1);
    let err = ctx.write_chunk(17, &pattern(500, 17)).await.unwrap_err();
    assert!(matches!(err, ChunkStoreError::Remote(_)));
    assert_eq!(ctx.storage.put_count(), 1);
}

#[tokio::test]
async fn test_put_timeout_counts_as_failure() {
    let ctx = TestStore::with_config(ChunkConfig {
        max_retries: 0,
        put_timeout: Duration::from_millis(100),
        ..test_config()
    })
    .await;
    ctx.storage.set_put_delay(Duration::from_secs(2));
    let err = ctx.write_chunk(18, b"slow").await.unwrap_err();
    assert!(err.to_string().contains("timeout"), "unexpected error: {err}");
}

// ===== Read errors =====

#[tokio::test]
async fn test_get_timeout() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        get_timeout: Duration::from_millis(200),
        ..test_config()
    })
    .await;
    ctx.write_chunk(19, b"data").await.unwrap();
    ctx.storage.set_get_delay(Duration::from_secs(2));

    let err = ctx.read_chunk(19, 4, 0, 4).await.unwrap_err();
    assert!(matches!(err, ChunkStoreError::Timeout(_)));
}

#[tokio::test]
async fn test_ranged_get_timeout() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        get_timeout: Duration::from_millis(200),
        ..test_config()
    })
    .await;
    let data = pattern(BLOCK, 5);
    ctx.write_chunk(5, &data).await.unwrap();
    ctx.storage.set_get_delay(Duration::from_secs(3));

    let start = tokio::time::Instant::now();
    let err = ctx.read_chunk(5, BLOCK, 1000, 100).await.unwrap_err();
    assert!(matches!(err, ChunkStoreError::Timeout(_)));
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn test_get_retried_once() {
    let ctx = TestStore::with_config(ChunkConfig {
        cache_size: 0,
        ..test_config()
    })
    .await;
    let data = pattern(100, 20);
    ctx.write_chunk(20, &data).await.unwrap();
    ctx.storage.fail_next_gets(1);

    assert_eq!(ctx.read_chunk(20, 100, 0, 100).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 2);
}

#[tokio::test]
async fn test_missing_object() {
    let ctx = TestStore::new().await;
    let err = ctx.read_chunk(21, 100, 0, 100).await.unwrap_err();
    assert!(matches!(err, ChunkStoreError::ObjectNotFound(_)));
}

#[tokio::test]
async fn test_concurrent_reads_share_one_fetch() {
    let ctx = TestStore::new().await;
    let data = pattern(BLOCK, 22);
    ctx.write_chunk(22, &data).await.unwrap();
    ctx.store.evict_cache(22, BLOCK).await.unwrap();
    ctx.storage.set_get_delay(Duration::from_millis(200));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let store = ctx.store.clone();
        handles.push(tokio::spawn(async move {
            let reader = store.new_reader(22, BLOCK);
            let mut buf = vec![0u8; BLOCK];
            reader.read_at(&mut buf, 0).await.map(|_| buf)
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), data);
    }
    assert_eq!(ctx.storage.get_count(), 1);
    assert_eq!(ctx.store.fetches_in_flight(), 0);
}

// ===== Remove =====

#[tokio::test]
async fn test_remove_chunk() {
    let ctx = TestStore::new().await;
    let len = BLOCK * 2;
    ctx.write_chunk(23, &pattern(len, 23)).await.unwrap();
    assert_eq!(ctx.storage.len(), 2);

    ctx.store.remove(23, len).await.unwrap();
    assert!(ctx.storage.is_empty());
    assert_eq!(ctx.store.check_cache(23, len).await.unwrap(), len as u64);

    let err = ctx.store.remove(23, len).await.unwrap_err();
    assert_eq!(err, ChunkStoreError::ChunkNotFound(23));
}

#[tokio::test]
async fn test_remove_empty_chunk() {
    let ctx = TestStore::new().await;
    ctx.store.remove(24, 0).await.unwrap();
    assert_eq!(ctx.storage.delete_count(), 0);
}

#[tokio::test]
async fn test_concurrent_removers() {
    let ctx = TestStore::new().await;
    let len = BLOCK * 3;
    ctx.write_chunk(25, &pattern(len, 25)).await.unwrap();

    let a = ctx.store.clone();
    let b = ctx.store.clone();
    let (ra, rb) = tokio::join!(a.remove(25, len), b.remove(25, len));
    assert!(ra.is_ok() || rb.is_ok());
    assert!(ctx.storage.is_empty());
}

// ===== Cache warmup =====

#[tokio::test]
async fn test_fill_and_check_cache() {
    let ctx = TestStore::new().await;
    let len = BLOCK * 2 + 1;
    let data = pattern(len, 26);
    ctx.write_chunk(26, &data).await.unwrap();

    assert_eq!(ctx.store.check_cache(26, len).await.unwrap(), 0);
    ctx.store.evict_cache(26, len).await.unwrap();
    assert_eq!(ctx.store.check_cache(26, len).await.unwrap(), len as u64);

    ctx.store.fill_cache(26, len).await.unwrap();
    assert_eq!(ctx.store.check_cache(26, len).await.unwrap(), 0);
    let gets = ctx.storage.get_count();
    assert_eq!(gets, 3);

    assert_eq!(ctx.read_chunk(26, len, 0, len).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), gets);
    assert!(ctx.store.used_memory() >= len as i64);
}

#[tokio::test]
async fn test_fill_cache_reports_missing_blocks() {
    let ctx = TestStore::new().await;
    let err = ctx.store.fill_cache(27, 100).await.unwrap_err();
    assert!(matches!(err, ChunkStoreError::ObjectNotFound(_)));
}

#[tokio::test]
async fn test_corrupt_cache_file_falls_back_to_storage() {
    let ctx = TestStore::on_disk(test_config()).await;
    let data = pattern(4000, 28);
    tokio_test::assert_ok!(ctx.write_chunk(28, &data).await);

    let name = ctx.object_key(28, 0, 4000);
    let path = ctx.cache_dir().join("raw").join(&name);
    let probe = path.clone();
    assert!(wait_until(Duration::from_secs(5), || probe.exists()).await);
    // Let the flusher drop its in-memory copy.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut raw = std::fs::read(&path).unwrap();
    raw[10] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    assert_eq!(ctx.read_chunk(28, 4000, 0, 4000).await.unwrap(), data);
    assert_eq!(ctx.storage.get_count(), 1);
}

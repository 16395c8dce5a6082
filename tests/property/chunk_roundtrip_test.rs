// tests/property/chunk_roundtrip_test.rs

//! Property-based tests for chunk write/read roundtrips
//! Whatever sequence of writes builds a chunk, reads must see the same bytes

use crate::test_helpers::{TestStore, test_config};
use chunkstore::config::{ChunkConfig, CompressAlgorithm};
use chunkstore::core::store::ChunkStore;
use proptest::prelude::*;

const BLOCK: usize = 64 << 10;
const MAX_LEN: usize = BLOCK * 5 + 1000;

fn config(compress: CompressAlgorithm, cache_size: u64) -> ChunkConfig {
    ChunkConfig {
        block_size: BLOCK,
        compress,
        cache_size,
        ..test_config()
    }
}

fn compress() -> impl Strategy<Value = CompressAlgorithm> {
    prop_oneof![
        Just(CompressAlgorithm::None),
        Just(CompressAlgorithm::Zstd),
        Just(CompressAlgorithm::Lz4),
    ]
}

fn write() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (0..MAX_LEN).prop_flat_map(|off| {
        (
            Just(off),
            prop::collection::vec(any::<u8>(), 1..=(MAX_LEN - off).min(BLOCK * 2)),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_random_writes_roundtrip(
        writes in prop::collection::vec(write(), 1..8),
        reads in prop::collection::vec((0.0f64..1.0, 1usize..(BLOCK * 3)), 1..8),
        compress in compress(),
        cached in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cache_size = if cached { 64 << 20 } else { 0 };
            let ctx = TestStore::with_config(config(compress, cache_size)).await;

            let mut model = Vec::new();
            let mut writer = ctx.store.new_writer(1);
            for (off, data) in &writes {
                writer.write_at(data, *off).unwrap();
                if model.len() < off + data.len() {
                    model.resize(off + data.len(), 0);
                }
                model[*off..off + data.len()].copy_from_slice(data);
            }
            assert_eq!(writer.len(), model.len());
            writer.finish(model.len()).await.unwrap();

            // Every block is in the object storage.
            assert_eq!(ctx.storage.len(), model.len().div_ceil(BLOCK));

            for (off_frac, n) in &reads {
                let off = ((model.len() - 1) as f64 * off_frac) as usize;
                let got = ctx.read_chunk(1, model.len(), off, *n).await.unwrap();
                let end = (off + n).min(model.len());
                assert_eq!(got.len(), end - off);
                assert!(got == model[off..end], "mismatch reading {} bytes at {}", n, off);
            }
        });
    }
}

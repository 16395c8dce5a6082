// tests/property/checksum_test.rs

//! Property-based tests for checksummed cache files
//! Reads at every verification level must return the stored bytes unchanged

use chunkstore::config::ChecksumLevel;
use chunkstore::core::checksum::{CHECKSUM_BLOCK, CacheFile, checksum};
use chunkstore::core::errors::ChunkStoreError;
use proptest::prelude::*;

fn level() -> impl Strategy<Value = ChecksumLevel> {
    prop_oneof![
        Just(ChecksumLevel::None),
        Just(ChecksumLevel::Full),
        Just(ChecksumLevel::Shrink),
        Just(ChecksumLevel::Extend),
    ]
}

fn store(data: &[u8]) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut content = data.to_vec();
    content.extend_from_slice(&checksum(data));
    std::fs::write(file.path(), content).unwrap();
    file
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_reads_return_stored_bytes(
        data in prop::collection::vec(any::<u8>(), 1..(CHECKSUM_BLOCK * 3)),
        off_frac in 0.0f64..1.0,
        len in 1usize..(CHECKSUM_BLOCK * 2),
        level in level(),
    ) {
        let file = store(&data);
        let cached = CacheFile::open(file.path(), data.len(), level).unwrap();
        let off = ((data.len() - 1) as f64 * off_frac) as usize;

        let mut buf = vec![0u8; len];
        let n = cached.read_at(&mut buf, off).unwrap();
        prop_assert_eq!(n, len.min(data.len() - off));
        prop_assert_eq!(&buf[..n], &data[off..off + n]);
    }

    #[test]
    fn test_extend_detects_corruption_in_touched_segment(
        data in prop::collection::vec(any::<u8>(), (CHECKSUM_BLOCK + 1)..(CHECKSUM_BLOCK * 3)),
        at_frac in 0.0f64..1.0,
    ) {
        let file = store(&data);
        let at = ((data.len() - 1) as f64 * at_frac) as usize;
        let mut content = std::fs::read(file.path()).unwrap();
        content[at] ^= 0x01;
        std::fs::write(file.path(), content).unwrap();

        let cached = CacheFile::open(file.path(), data.len(), ChecksumLevel::Extend).unwrap();
        let mut buf = [0u8; 1];
        let err = cached.read_at(&mut buf, at).unwrap_err();
        let is_mismatch = matches!(
            err,
            ChunkStoreError::ChecksumMismatch { segment, .. } if segment == at / CHECKSUM_BLOCK
        );
        prop_assert!(is_mismatch);
    }
}

// src/core/compress.rs

//! Block compression codecs.

use crate::core::errors::{ChunkStoreError, Result};

/// A block codec. `compress` and `decompress` write into caller-provided buffers and
/// return the number of bytes produced.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Upper bound of the compressed size for `len` input bytes.
    fn compress_bound(&self, len: usize) -> usize;
    fn compress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize>;
    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize>;
}

/// Returns the codec registered under `name`, or `None` if it is unknown.
pub fn new_compressor(name: &str) -> Option<Box<dyn Compressor>> {
    match name.to_lowercase().as_str() {
        "" | "none" => Some(Box::new(NoOp)),
        "zstd" => Some(Box::new(ZStandard { level: 1 })),
        "lz4" => Some(Box::new(Lz4)),
        _ => None,
    }
}

/// Stores blocks as-is. Its zero bound for empty input marks objects as seekable.
pub struct NoOp;

impl Compressor for NoOp {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compress_bound(&self, len: usize) -> usize {
        len
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(ChunkStoreError::Compress(format!(
                "buffer too short: {} < {}",
                dst.len(),
                src.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        self.compress(dst, src)
    }
}

pub struct ZStandard {
    level: i32,
}

impl Compressor for ZStandard {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress_bound(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        zstd::bulk::compress_to_buffer(src, dst, self.level)
            .map_err(|e| ChunkStoreError::Compress(format!("zstd compress: {e}")))
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|e| ChunkStoreError::Compress(format!("zstd decompress: {e}")))
    }
}

pub struct Lz4;

impl Compressor for Lz4 {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress_bound(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len) + 4
    }

    fn compress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        if dst.len() < 4 {
            return Err(ChunkStoreError::Compress("lz4 buffer too short".to_string()));
        }
        dst[..4].copy_from_slice(&(src.len() as u32).to_le_bytes());
        let n = lz4_flex::block::compress_into(src, &mut dst[4..])
            .map_err(|e| ChunkStoreError::Compress(format!("lz4 compress: {e}")))?;
        Ok(n + 4)
    }

    fn decompress(&self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        if src.len() < 4 {
            return Err(ChunkStoreError::Compress("lz4 input too short".to_string()));
        }
        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size > dst.len() {
            return Err(ChunkStoreError::Compress(format!(
                "lz4 output too large: {size} > {}",
                dst.len()
            )));
        }
        Ok(lz4_flex::block::decompress_into(&src[4..], &mut dst[..size])?)
    }
}

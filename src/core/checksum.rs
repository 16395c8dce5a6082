// src/core/checksum.rs

//! On-disk block codec with an optional CRC32C trailer.
//!
//! A cached block file holds the raw block bytes, optionally followed by one
//! big-endian CRC32C per 32 KiB segment. How much of a read is verified depends
//! on the configured [`ChecksumLevel`].

use crate::config::ChecksumLevel;
use crate::core::errors::{ChunkStoreError, Result};
use crc::{CRC_32_ISCSI, Crc};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Size of the data segment covered by one checksum entry.
pub const CHECKSUM_BLOCK: usize = 32 << 10;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Number of trailer bytes for a block of `length` bytes.
pub fn trailer_len(length: usize) -> usize {
    length.div_ceil(CHECKSUM_BLOCK) * 4
}

/// Computes the checksum trailer for `data`.
pub fn checksum(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(trailer_len(data.len()));
    for segment in data.chunks(CHECKSUM_BLOCK) {
        out.extend_from_slice(&CRC32C.checksum(segment).to_be_bytes());
    }
    out
}

/// A cached block opened for positioned reads.
#[derive(Debug)]
pub struct CacheFile {
    file: File,
    path: PathBuf,
    length: usize,
    level: ChecksumLevel,
    has_checksum: bool,
}

impl CacheFile {
    /// Opens `path` as a block of `length` bytes. The file must be exactly `length`
    /// bytes (no trailer) or `length` plus its checksum trailer.
    pub fn open(path: &Path, length: usize, level: ChecksumLevel) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        let has_checksum = if size == length {
            false
        } else if size == length + trailer_len(length) {
            true
        } else {
            return Err(ChunkStoreError::LengthMismatch {
                expected: length,
                actual: size,
            });
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            length,
            level,
            has_checksum,
        })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads into `buf` starting at `off`, returning the number of bytes read
    /// (short only at the end of the block).
    pub fn read_at(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        if off >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.length - off);
        let buf = &mut buf[..n];
        if !self.has_checksum {
            self.file.read_exact_at(buf, off as u64)?;
            return Ok(n);
        }
        match self.level {
            ChecksumLevel::None => {
                self.file.read_exact_at(buf, off as u64)?;
            }
            ChecksumLevel::Full => {
                self.file.read_exact_at(buf, off as u64)?;
                if off == 0 && n == self.length {
                    self.verify(buf, 0)?;
                }
            }
            ChecksumLevel::Shrink => {
                self.file.read_exact_at(buf, off as u64)?;
                let start = off.next_multiple_of(CHECKSUM_BLOCK);
                let end = if off + n == self.length {
                    self.length
                } else {
                    (off + n) / CHECKSUM_BLOCK * CHECKSUM_BLOCK
                };
                if start < end {
                    self.verify(&buf[start - off..end - off], start)?;
                }
            }
            ChecksumLevel::Extend => {
                let start = off / CHECKSUM_BLOCK * CHECKSUM_BLOCK;
                let end = (off + n).next_multiple_of(CHECKSUM_BLOCK).min(self.length);
                let mut window = vec![0u8; end - start];
                self.file.read_exact_at(&mut window, start as u64)?;
                self.verify(&window, start)?;
                buf.copy_from_slice(&window[off - start..off - start + n]);
            }
        }
        Ok(n)
    }

    /// Verifies `data`, which holds whole segments of the block starting at the
    /// segment-aligned offset `start`.
    fn verify(&self, data: &[u8], start: usize) -> Result<()> {
        let first = start / CHECKSUM_BLOCK;
        let count = data.len().div_ceil(CHECKSUM_BLOCK);
        let mut stored = vec![0u8; count * 4];
        self.file
            .read_exact_at(&mut stored, (self.length + first * 4) as u64)?;
        for (i, segment) in data.chunks(CHECKSUM_BLOCK).enumerate() {
            let expected = u32::from_be_bytes([
                stored[i * 4],
                stored[i * 4 + 1],
                stored[i * 4 + 2],
                stored[i * 4 + 3],
            ]);
            if CRC32C.checksum(segment) != expected {
                return Err(ChunkStoreError::ChecksumMismatch {
                    path: self.path.clone(),
                    segment: first + i,
                });
            }
        }
        Ok(())
    }
}

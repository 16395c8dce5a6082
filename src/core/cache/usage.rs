// src/core/cache/usage.rs

//! Free space and inode accounting of the device behind a cache directory.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Capacity of a filesystem: `(total bytes, free bytes, total inodes, free inodes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub files: u64,
    pub ffree: u64,
}

impl DiskUsage {
    /// Fractions of free bytes and free inodes. A filesystem that does not report
    /// inodes counts as having all of them free.
    pub fn free_ratio(&self) -> (f32, f32) {
        let br = if self.total == 0 {
            1.0
        } else {
            self.free as f32 / self.total as f32
        };
        let fr = if self.files == 0 {
            1.0
        } else {
            self.ffree as f32 / self.files as f32
        };
        (br, fr)
    }
}

/// Queries the filesystem holding `path`. `None` when it cannot be inspected.
pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let block_size = stat.f_frsize as u64;
    Some(DiskUsage {
        total: stat.f_blocks as u64 * block_size,
        free: stat.f_bavail as u64 * block_size,
        files: stat.f_files as u64,
        ffree: stat.f_favail as u64,
    })
}

// src/core/object/file.rs

use super::{ObjectInfo, ObjectStorage, range};
use crate::core::errors::{ChunkStoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Objects stored as files under a root directory, one file per key.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn not_found(key: &str, e: std::io::Error) -> ChunkStoreError {
    if e.kind() == ErrorKind::NotFound {
        ChunkStoreError::ObjectNotFound(key.to_string())
    } else {
        e.into()
    }
}

#[async_trait]
impl ObjectStorage for FileStorage {
    fn describe(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    async fn get(&self, key: &str, off: u64, limit: i64) -> Result<Bytes> {
        let path = self.path(key);
        if off == 0 && limit < 0 {
            let data = tokio::fs::read(&path).await.map_err(|e| not_found(key, e))?;
            return Ok(Bytes::from(data));
        }
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(key, e))?;
        let size = file.metadata().await?.len();
        if off > size {
            return range(&Bytes::new(), off, limit);
        }
        let want = if limit < 0 {
            size - off
        } else {
            (limit as u64).min(size - off)
        };
        file.seek(SeekFrom::Start(off)).await?;
        let mut data = vec![0u8; want as usize];
        file.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let written = async {
            file.write_all(&data).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.path(key))
            .await
            .map_err(|e| not_found(key, e))
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let marker = marker.to_string();
        let mut found = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            collect(&root, &root, &mut found);
            found.retain(|o: &ObjectInfo| o.key.starts_with(&prefix) && o.key > marker);
            found
        })
        .await?;
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found.truncate(limit);
        Ok(found)
    }
}

fn collect(root: &Path, dir: &Path, found: &mut Vec<ObjectInfo>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect(root, &path, found);
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "tmp") {
            continue;
        }
        let Some(key) = path
            .strip_prefix(root)
            .ok()
            .and_then(|p| p.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        found.push(ObjectInfo {
            key,
            size: meta.len(),
            mtime: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        });
    }
}

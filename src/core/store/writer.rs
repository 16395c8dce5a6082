// src/core/store/writer.rs

use super::{CHUNK_SIZE, PAGE_SIZE, StoreInner};
use crate::core::buffer::{Page, PageMut};
use crate::core::cache::BlockKey;
use crate::core::errors::{ChunkStoreError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static ZEROS: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Buffers the data of one chunk and uploads it block by block.
///
/// Writes are accepted at any offset at or after the upload watermark; holes are
/// filled with zeros. `flush_to` uploads complete blocks in the background and
/// `finish` uploads the rest and waits for every block.
pub struct ChunkWriter {
    store: Arc<StoreInner>,
    id: u64,
    length: usize,
    pages: Vec<Vec<PageMut>>,
    uploaded: usize,
    pending: usize,
    done_tx: mpsc::Sender<Result<()>>,
    done_rx: mpsc::Receiver<Result<()>>,
    upload_error: Arc<Mutex<Option<ChunkStoreError>>>,
}

impl ChunkWriter {
    pub(super) fn new(store: Arc<StoreInner>, id: u64) -> Self {
        let blocks = CHUNK_SIZE / store.config.block_size;
        // Every block reports exactly once.
        let (done_tx, done_rx) = mpsc::channel(blocks);
        Self {
            store,
            id,
            length: 0,
            pages: (0..blocks).map(|_| Vec::new()).collect(),
            uploaded: 0,
            pending: 0,
            done_tx,
            done_rx,
            upload_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Changes the chunk id. Blocks already handed to `flush_to` keep the old one.
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// The highest offset written so far.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn write_at(&mut self, data: &[u8], off: usize) -> Result<usize> {
        if off + data.len() > CHUNK_SIZE {
            return Err(ChunkStoreError::InvalidArgument(format!(
                "write out of chunk boundary: {} > {}",
                off + data.len(),
                CHUNK_SIZE
            )));
        }
        if off < self.uploaded {
            return Err(ChunkStoreError::InvalidArgument(format!(
                "cannot overwrite uploaded block: {} < {}",
                off, self.uploaded
            )));
        }
        while self.length < off {
            let n = (off - self.length).min(ZEROS.len());
            self.copy_in(&ZEROS[..n], self.length);
        }
        self.copy_in(data, off);
        Ok(data.len())
    }

    fn copy_in(&mut self, data: &[u8], off: usize) {
        let bsize = self.store.config.block_size;
        let mut n = 0;
        while n < data.len() {
            let pos = off + n;
            let indx = pos / bsize;
            let boff = pos % bsize;
            let psize = if indx == 0 && bsize > PAGE_SIZE {
                PAGE_SIZE
            } else {
                bsize
            };
            let (pi, po) = (boff / psize, boff % psize);

            let pages = &mut self.pages[indx];
            while pages.len() <= pi {
                let mut page = self.store.alloc(psize);
                page.set_len(0);
                pages.push(page);
            }
            let page = &mut pages[pi];
            let m = (psize - po).min(data.len() - n);
            let filled = page.len();
            let buf = page.as_mut_slice();
            if filled < po {
                buf[filled..po].fill(0);
            }
            buf[po..po + m].copy_from_slice(&data[n..n + m]);
            if po + m > filled {
                page.set_len(po + m);
            }
            n += m;
        }
        self.length = self.length.max(off + n);
    }

    /// Starts uploading every block that ends at or before `offset`.
    pub fn flush_to(&mut self, offset: usize) -> Result<()> {
        if offset < self.uploaded {
            return Err(ChunkStoreError::InvalidArgument(format!(
                "invalid flush offset {} < {}",
                offset, self.uploaded
            )));
        }
        let bsize = self.store.config.block_size;
        for indx in 0..self.pages.len() {
            let start = indx * bsize;
            let end = start + bsize;
            if start >= self.uploaded && end <= offset {
                if !self.pages[indx].is_empty() {
                    self.upload(indx);
                }
                self.uploaded = end;
            }
        }
        Ok(())
    }

    /// Uploads the remaining blocks and waits for all uploads of this chunk. The
    /// first failure is returned and stops the retries of the other blocks.
    pub async fn finish(&mut self, length: usize) -> Result<()> {
        if length != self.length {
            return Err(ChunkStoreError::LengthMismatch {
                expected: self.length,
                actual: length,
            });
        }
        let bsize = self.store.config.block_size;
        self.flush_to(self.length.div_ceil(bsize) * bsize)?;

        let mut first_err = None;
        while self.pending > 0 {
            match self.done_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    if first_err.is_none() {
                        *self.upload_error.lock() = Some(e.clone());
                        first_err = Some(e);
                    }
                }
                None => break,
            }
            self.pending -= 1;
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drops all buffered data. Uploads already started are not cancelled.
    pub fn abort(&mut self) {
        for pages in &mut self.pages {
            pages.clear();
        }
        self.length = self.uploaded;
    }

    fn upload(&mut self, indx: usize) {
        let blen = self.store.block_len(self.length, indx);
        let key = BlockKey::new(self.id, indx as u32, blen as u32);
        let pages = std::mem::take(&mut self.pages[indx]);
        self.pending += 1;

        let store = self.store.clone();
        let done = self.done_tx.clone();
        let upload_error = self.upload_error.clone();
        tokio::spawn(async move {
            match assemble(&store, &key, pages, blen) {
                Ok(block) => store.upload_block(key, block, upload_error, done).await,
                Err(e) => {
                    let _ = done.send(Err(e)).await;
                }
            }
        });
    }
}

/// Joins the pages of a block into one page of exactly `blen` bytes.
fn assemble(
    store: &StoreInner,
    key: &BlockKey,
    pages: Vec<PageMut>,
    blen: usize,
) -> Result<Page> {
    if pages.len() == 1 && pages[0].len() == blen {
        if let Some(page) = pages.into_iter().next() {
            return Ok(page.freeze());
        }
        return Err(ChunkStoreError::Internal(format!("block {key} has no data")));
    }
    let mut block = store.alloc(blen);
    block.set_len(blen);
    let mut off = 0;
    for page in &pages {
        let data = page.as_slice();
        if off + data.len() > blen {
            off += data.len();
            break;
        }
        block.as_mut_slice()[off..off + data.len()].copy_from_slice(data);
        off += data.len();
    }
    if off != blen {
        return Err(ChunkStoreError::Internal(format!(
            "block {key} holds {off} bytes, expected {blen}"
        )));
    }
    Ok(block.freeze())
}

impl StoreInner {
    async fn upload_block(
        self: Arc<Self>,
        key: BlockKey,
        block: Page,
        upload_error: Arc<Mutex<Option<ChunkStoreError>>>,
        done: mpsc::Sender<Result<()>>,
    ) {
        if self.config.writeback {
            let keep = self.should_cache(block.len());
            match self.bcache.stage(&key, block.as_slice(), keep).await {
                Ok(path) => {
                    let _ = done.send(Ok(())).await;
                    self.upload_staged_block(key, block, path).await;
                    return;
                }
                Err(e) => warn!("write {} to disk: {}, upload it directly", key, e),
            }
        }
        let result = self.sync_upload(key, block, &upload_error).await;
        let _ = done.send(result).await;
    }

    /// Compresses and uploads a block, retrying with quadratic backoff until it
    /// succeeds, `max_retries` is exhausted or another block of the chunk failed.
    async fn sync_upload(
        &self,
        key: BlockKey,
        block: Page,
        upload_error: &Mutex<Option<ChunkStoreError>>,
    ) -> Result<()> {
        let blen = block.len();
        let data = self.compress(block.as_slice())?;
        if self.should_cache(blen) {
            self.bcache.cache(&key, block, false).await;
        } else {
            drop(block);
        }

        let _permit = self
            .upload_permits
            .acquire()
            .await
            .map_err(|e| ChunkStoreError::Internal(e.to_string()))?;
        let name = self.object_name(&key);
        let mut tried = 0u64;
        loop {
            let failed = upload_error.lock().clone();
            if let Some(e) = failed {
                debug!("give up uploading {}: {}", name, e);
                return Err(e);
            }
            match self.put(&name, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tried += 1;
                    warn!("upload {}: {} (try {})", name, e, tried);
                    if tried > self.config.max_retries as u64 {
                        return Err(ChunkStoreError::Remote(format!(
                            "upload block {name}: {e} (after {tried} tries)"
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(tried * tried)).await;
                }
            }
        }
    }
}

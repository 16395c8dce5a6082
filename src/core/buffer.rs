// src/core/buffer.rs

//! Reference-counted block buffers.
//!
//! A [`Page`] is an immutable, shareable view into a byte allocation. Cloning a page
//! (or calling [`Page::acquire`]) takes another reference; dropping it (or calling
//! [`Page::release`]) gives it back. Slices share the parent allocation, which stays
//! alive until the last slice and the parent itself are released. Writable buffers
//! are built in a [`PageMut`] and frozen into a `Page` once complete.
//!
//! Standard-size allocations are recycled through a bounded [`PagePool`].

use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Bytes currently held by live page allocations.
static USED_MEMORY: AtomicI64 = AtomicI64::new(0);

/// Returns the number of bytes held by all live page allocations in the process.
pub fn used_memory() -> i64 {
    USED_MEMORY.load(Ordering::Relaxed)
}

/// A bounded free list of standard-size buffers.
pub struct PagePool {
    page_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl PagePool {
    pub fn new(page_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of buffers waiting in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Allocates a writable buffer of `size` bytes. Only `page_size` buffers are
    /// taken from (and later returned to) the pool.
    pub fn alloc(self: &Arc<Self>, size: usize) -> PageMut {
        if size != self.page_size {
            return PageMut::zeroed(size);
        }
        let buf = self.free.lock().pop().unwrap_or_else(|| vec![0u8; size]);
        PageMut {
            data: PageData::new(buf, Some(self.clone())),
            len: 0,
        }
    }

    fn recycle(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

/// The owned allocation behind pages. Returns itself to its pool when the last
/// reference goes away.
struct PageData {
    buf: Vec<u8>,
    pool: Option<Arc<PagePool>>,
}

impl PageData {
    fn new(buf: Vec<u8>, pool: Option<Arc<PagePool>>) -> Self {
        USED_MEMORY.fetch_add(buf.capacity() as i64, Ordering::Relaxed);
        Self { buf, pool }
    }
}

impl Drop for PageData {
    fn drop(&mut self) {
        USED_MEMORY.fetch_sub(self.buf.capacity() as i64, Ordering::Relaxed);
        if let Some(pool) = self.pool.take()
            && self.buf.len() == pool.page_size
        {
            pool.recycle(std::mem::take(&mut self.buf));
        }
    }
}

/// A uniquely owned, writable buffer.
///
/// The full allocation is addressable through [`PageMut::as_mut_slice`]; `len`
/// tracks how much of it holds meaningful data and becomes the length of the
/// frozen [`Page`].
pub struct PageMut {
    data: PageData,
    len: usize,
}

impl PageMut {
    /// Allocates a zero-filled buffer outside of any pool, with `len == size`.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: PageData::new(vec![0u8; size], None),
            len: size,
        }
    }

    /// Total addressable bytes.
    pub fn capacity(&self) -> usize {
        self.data.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the meaningful length. Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "page length {len} exceeds capacity");
        self.len = len;
    }

    /// The written part of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data.buf[..self.len]
    }

    /// The whole allocation, regardless of `len`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data.buf
    }

    /// Converts into a shareable page covering `[0, len)`.
    pub fn freeze(self) -> Page {
        let len = self.len;
        Page {
            data: Arc::new(self.data),
            off: 0,
            len,
        }
    }
}

impl fmt::Debug for PageMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMut")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// An immutable, reference-counted block buffer.
#[derive(Clone)]
pub struct Page {
    data: Arc<PageData>,
    off: usize,
    len: usize,
}

impl Page {
    /// Wraps existing bytes into a page with a single reference.
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(PageData::new(data, None)),
            off: 0,
            len,
        }
    }

    /// Takes another reference to the same bytes.
    pub fn acquire(&self) -> Page {
        self.clone()
    }

    /// Gives this reference back. The allocation is freed (or pooled) when the
    /// last reference, including those held by slices, is released.
    pub fn release(self) {}

    /// Number of live references to the underlying allocation, slices included.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Returns a zero-copy view of `[off, off + len)` that keeps the parent alive.
    /// Panics if the range is out of bounds.
    pub fn slice(&self, off: usize, len: usize) -> Page {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "slice [{off}, {off}+{len}) out of page bounds {}",
            self.len
        );
        Page {
            data: self.data.clone(),
            off: self.off + off,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.buf[self.off..self.off + self.len]
    }

    /// Copies `[off, ...)` of this page into `buf`, returning the bytes copied.
    pub fn read_at(&self, buf: &mut [u8], off: usize) -> usize {
        if off >= self.len {
            return 0;
        }
        let n = buf.len().min(self.len - off);
        buf[..n].copy_from_slice(&self.as_slice()[off..off + n]);
        n
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Page {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("off", &self.off)
            .field("len", &self.len)
            .field("refs", &self.refs())
            .finish()
    }
}

//! Size-classed byte buffer pool for frame payloads.
//!
//! Frames read off a connection and the responses written back are carried
//! in [`PooledBuf`]s. A buffer is owned by exactly one request at a time and
//! handed back through [`BufferPool::release`], which consumes it, so a
//! released buffer can never be observed again by the code that gave it up.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

/// Capacity classes served from the pool. Larger requests are allocated
/// exactly and dropped on release.
pub const SIZE_CLASSES: [usize; 2] = [1024, 2048];

/// Maximum number of idle buffers retained per class.
pub const MAX_IDLE_PER_CLASS: usize = 1000;

/// Shared pool of reusable byte buffers.
///
/// Cloning is cheap and every clone refers to the same free lists.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    classes: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle_counts())
            .finish()
    }
}

fn class_for(size: usize) -> Option<usize> { SIZE_CLASSES.iter().position(|&cap| size <= cap) }

impl BufferPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Take a zero-filled buffer of exactly `size` bytes.
    ///
    /// Sizes that fit a capacity class reuse an idle buffer when one is
    /// available.
    ///
    /// # Examples
    ///
    /// ```
    /// use relayframe::buffer_pool::BufferPool;
    ///
    /// let pool = BufferPool::new();
    /// let buf = pool.acquire(10);
    /// assert_eq!(buf.len(), 10);
    /// pool.release(buf);
    /// ```
    #[must_use]
    pub fn acquire(&self, size: usize) -> PooledBuf {
        let class = class_for(size);
        let mut data = class
            .and_then(|idx| self.lock_class(idx).pop())
            .unwrap_or_else(|| {
                Vec::with_capacity(class.map_or(size, |idx| SIZE_CLASSES[idx]))
            });
        data.clear();
        data.resize(size, 0);
        PooledBuf { data, class }
    }

    /// Take a buffer holding a copy of `bytes`.
    #[must_use]
    pub fn acquire_from(&self, bytes: &[u8]) -> PooledBuf {
        let mut buf = self.acquire(bytes.len());
        buf.copy_from_slice(bytes);
        buf
    }

    /// Return `buf` to its capacity class.
    ///
    /// Buffers outside every class, or arriving when the class is full, are
    /// dropped.
    pub fn release(&self, buf: PooledBuf) {
        let PooledBuf { data, class } = buf;
        let Some(idx) = class else { return };
        if data.capacity() < SIZE_CLASSES[idx] {
            return;
        }
        let mut idle = self.lock_class(idx);
        if idle.len() < MAX_IDLE_PER_CLASS {
            idle.push(data);
        }
    }

    /// Number of idle buffers per class.
    #[must_use]
    pub fn idle_counts(&self) -> [usize; SIZE_CLASSES.len()] {
        std::array::from_fn(|idx| self.lock_class(idx).len())
    }

    fn lock_class(&self, idx: usize) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.inner.classes[idx]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Byte buffer exclusively owned by one holder until released.
pub struct PooledBuf {
    data: Vec<u8>,
    class: Option<usize>,
}

impl PooledBuf {
    /// Wrap an owned vector that did not come from a pool.
    #[must_use]
    pub fn unpooled(data: Vec<u8>) -> Self { Self { data, class: None } }

    /// Shorten the buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) { self.data.truncate(len); }

    /// Capacity class this buffer returns to, if any.
    #[must_use]
    pub fn class(&self) -> Option<usize> { self.class }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.data.len())
            .field("class", &self.class)
            .finish()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target { &self.data }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.data }
}

impl From<Vec<u8>> for PooledBuf {
    fn from(data: Vec<u8>) -> Self { Self::unpooled(data) }
}

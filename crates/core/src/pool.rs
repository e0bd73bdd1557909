//! Reusable frame buffers with explicit, idempotent release.
//!
//! The pool keeps a free list of [`BytesMut`] buffers and caps how many may
//! be handed out at once. Exceeding the cap is the one resource error the
//! core surfaces to callers ([`VideoError::PoolExhausted`]).
//!
//! A [`PooledBuffer`] returns itself to the pool on [`release`](PooledBuffer::release)
//! or on drop, whichever comes first. Forgetting a buffer (`mem::forget`)
//! keeps its slot occupied forever: the pool shrinks, memory stays sound.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{Result, VideoError};

/// Default number of buffers that may be outstanding at once.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    limit: usize,
}

/// Shared handle to a bounded buffer pool. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool allowing at most `limit` buffers outstanding.
    pub fn new(limit: usize) -> Self {
        tracing::debug!(limit, "buffer pool created");
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                limit,
            }),
        }
    }

    /// Take an empty buffer with room for at least `capacity` bytes.
    pub fn acquire(&self, capacity: usize) -> Result<PooledBuffer> {
        let limit = self.inner.limit;
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| {
                tracing::warn!(limit, "buffer pool exhausted");
                VideoError::PoolExhausted { limit }
            })?;

        let mut buf = self.inner.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(capacity);

        Ok(PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        })
    }

    /// Number of buffers currently handed out (including leaked ones).
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Number of released buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Maximum number of buffers that may be outstanding.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("limit", &self.inner.limit)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Dereferences to the written bytes; empty once released.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Append bytes. Has no effect after release.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Return the buffer to its pool.
    ///
    /// Returns `true` if this call performed the release, `false` if the
    /// buffer had already been released.
    pub fn release(&mut self) -> bool {
        let Some(buf) = self.buf.take() else {
            return false;
        };
        {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.limit {
                free.push(buf);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.buf.is_none()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_tracks_outstanding() {
        let pool = BufferPool::new(4);
        let mut a = pool.acquire(16).unwrap();
        let _b = pool.acquire(16).unwrap();
        assert_eq!(pool.outstanding(), 2);

        assert!(a.release());
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn double_release_is_noop() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire(8).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(buf.release());
        assert!(!buf.release());
        assert!(buf.is_empty());
        drop(buf);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = BufferPool::new(1);
        let _held = pool.acquire(8).unwrap();
        let err = pool.acquire(8).unwrap_err();
        assert!(matches!(err, VideoError::PoolExhausted { limit: 1 }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn drop_returns_buffer_for_reuse() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.acquire(8).unwrap();
            buf.extend_from_slice(b"frame");
        }
        let reused = pool.acquire(8).unwrap();
        assert!(reused.is_empty(), "reused buffer must be cleared");
    }

    #[test]
    fn leaked_buffer_shrinks_capacity() {
        let pool = BufferPool::new(2);
        std::mem::forget(pool.acquire(8).unwrap());
        let _ok = pool.acquire(8).unwrap();
        assert!(pool.acquire(8).is_err());
    }
}

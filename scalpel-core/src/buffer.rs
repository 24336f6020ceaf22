//! Reusable scratch buffers.
//!
//! Envelope payloads and (de)compression output are staged in buffers drawn
//! from a [`BufferPool`]. A [`PooledBuffer`] goes back to its pool when it is
//! dropped, so every exit path (success, error, early return) returns it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::BytesMut;

/// Capacity given to freshly allocated buffers.
const INITIAL_CAPACITY: usize = 512;

/// Buffers that grew beyond this are freed instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 4 * 1024 * 1024;

/// Upper bound on idle buffers kept by one pool.
const MAX_IDLE_BUFFERS: usize = 64;

/// A pool of reusable byte buffers.
///
/// Cloning a pool yields another handle to the same buffers.
#[derive(Clone, Debug, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Take an empty buffer from the pool, allocating if none is idle.
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < MAX_IDLE_BUFFERS
        {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Dereferences to [`BytesMut`]. Borrows of the contents cannot outlive the
/// guard, so nothing can hold on to the buffer after it is returned.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}

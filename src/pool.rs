//! Free-lists recycling per-request state across requests.
//!
//! A [`Pool`] is a mutex-protected stack of idle values. [`Pool::acquire`]
//! pops one (or creates a fresh one when the stack is empty) and wraps it in a
//! [`Pooled`] guard; dropping the guard resets the value and pushes it back.
//! Resetting happens on every path, including when a response body is dropped
//! half-way, so no sink data, buffered bytes or open compressor leaks into the
//! next request.

use crate::body::CompressedState;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Buffers that grew beyond this are shrunk before going back to the pool.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// A value that can be returned to its zero state for reuse.
pub(crate) trait Recycle: Default {
    /// Clears all per-request state.
    fn reset(&mut self);
}

impl Recycle for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
        if self.capacity() > MAX_RETAINED_CAPACITY {
            self.shrink_to(MAX_RETAINED_CAPACITY);
        }
    }
}

/// A thread-safe stack of idle values.
pub(crate) struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Recycle> Pool<T> {
    /// Creates a pool retaining at most `max_idle` values.
    pub(crate) fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes an idle value, or creates one if none is available.
    pub(crate) fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let item = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();

        Pooled {
            item,
            pool: Arc::clone(self),
        }
    }

    /// Resets `item` and keeps it if the pool has room.
    fn release(&self, mut item: T) {
        // Reset outside the lock: it may close a compressor.
        item.reset();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    /// Returns the number of idle values.
    pub(crate) fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> fmt::Debug for Pool<T>
where
    T: Recycle,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// RAII guard returning its value to the pool on drop.
pub(crate) struct Pooled<T: Recycle> {
    item: T,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        let item = std::mem::take(&mut self.item);
        self.pool.release(item);
    }
}

/// The pools shared by every request going through one layer.
#[derive(Debug, Clone)]
pub(crate) struct Pools {
    /// Accumulation buffers for bodies awaiting a compression decision.
    pub(crate) buffers: Arc<Pool<Vec<u8>>>,
    /// Compression states: writer slot plus output buffer.
    pub(crate) encoders: Arc<Pool<CompressedState>>,
}

impl Pools {
    pub(crate) fn new() -> Self {
        let max_idle = std::thread::available_parallelism()
            .map(|p| p.get() * 4)
            .unwrap_or(16);
        Self {
            buffers: Arc::new(Pool::new(max_idle)),
            encoders: Arc::new(Pool::new(max_idle)),
        }
    }
}

//! Bounded recycler for frequently allocated values.
//!
//! Neither [`Pool::acquire`] nor [`Pool::release`] ever waits: when the free
//! list is contended or empty, `acquire` hands out a fresh value, and when it
//! is contended or full, `release` simply drops the value. Correctness never
//! depends on the pool, it only saves allocations.

use parking_lot::Mutex;

/// Default number of idle values a pool keeps around.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Values that can be reset to a blank state before reuse.
pub trait Recycle {
    /// Clear all contents while keeping allocated buffers.
    fn recycle(&mut self);
}

pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Default + Recycle> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a blank value, recycled if one is idle.
    pub fn acquire(&self) -> T {
        self.free
            .try_lock()
            .and_then(|mut free| free.pop())
            .unwrap_or_default()
    }

    /// Hand a value back. It is reset first, and dropped if the pool is full.
    pub fn release(&self, mut item: T) {
        item.recycle();
        if let Some(mut free) = self.free.try_lock() {
            if free.len() < self.capacity {
                free.push(item);
            }
        }
    }

    /// Number of idle values currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Default + Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

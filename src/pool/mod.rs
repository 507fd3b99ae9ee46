//! Object recycling
//!
//! Tiles and task instances are created and retired at high rates; instead
//! of a bespoke allocator, retired instances park on an idle list and are
//! reset on their next use. Handles are `Arc`s, so an instance can only be
//! parked by the caller holding the last reference — otherwise the storage
//! is simply freed when the remaining handles drop.

use std::sync::Arc;

use parking_lot::Mutex;

/// Idle-list recycler for `Arc`-managed instances.
#[derive(Debug)]
pub struct Recycler<T> {
    /// Parked instances, ready for reuse.
    idle: Mutex<Vec<T>>,
    /// Maximum number of parked instances.
    capacity: usize,
}

impl<T> Recycler<T> {
    /// Create a recycler keeping at most `capacity` idle instances.
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take a parked instance, if any.
    #[inline]
    pub fn take(&self) -> Option<T> {
        self.idle.lock().pop()
    }

    /// Park an instance for reuse.
    ///
    /// Returns `true` if the caller held the last reference and the instance
    /// was parked; `false` if other handles are still alive or the idle list
    /// is full.
    pub fn put(&self, handle: Arc<T>) -> bool {
        match Arc::try_unwrap(handle) {
            Ok(value) => {
                let mut idle = self.idle.lock();
                if idle.len() < self.capacity {
                    idle.push(value);
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Number of parked instances.
    #[inline]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

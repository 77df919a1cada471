//! Fixed-capacity lookaside pool for short-lived per-send scratch objects.

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// A capped free-list allocator. `acquire` hands out boxed entries up to the
/// configured capacity and recycles released boxes rather than touching the
/// allocator on the hot path.
pub(crate) struct Lookaside<T: Default> {
    free: Mutex<Vec<Box<T>>>,
    outstanding: AtomicUsize,
    capacity: usize,
}

impl<T: Default> Lookaside<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            outstanding: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Take an entry, or `None` when the pool is exhausted. The entry may
    /// hold stale contents from a previous use; callers overwrite every
    /// field before submitting it.
    pub fn acquire(&self) -> Option<Box<T>> {
        if self.outstanding.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        if let Some(entry) = self.free.lock().pop() {
            return Some(entry);
        }
        Some(Box::new(T::default()))
    }

    pub fn release(&self, entry: Box<T>) {
        self.free.lock().push(entry);
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pool release without acquire");
    }

    pub fn in_use(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

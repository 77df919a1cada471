//! Read-mostly publication of the per-device socket pair.
//!
//! Senders and the receive dispatcher enter a cheap read section, dereference
//! the socket for their address family, and use it without taking any lock.
//! Writers swap the published pointers under the device's exclusive update
//! lock and then wait for a grace period — a point at which every reader that
//! could have observed the displaced pointer has left its section — before
//! closing the old socket. Read sections are sharded counters so concurrent
//! readers on different threads do not contend on one cache line.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::counter;
use crate::routing::Family;

#[repr(align(128))]
struct ReadShard {
    active: AtomicUsize,
}

/// A pair of published pointers (one per address family) with read-section /
/// grace-period reclamation.
pub(crate) struct RcuPair<T> {
    shards: Box<[ReadShard]>,
    mask: usize,
    v4: AtomicPtr<T>,
    v6: AtomicPtr<T>,
    _owned: PhantomData<Arc<T>>,
}

impl<T: Send + Sync> RcuPair<T> {
    /// `shards` must be a power of two.
    pub fn new(shards: usize) -> Self {
        debug_assert!(shards.is_power_of_two());
        let shards: Box<[ReadShard]> = (0..shards)
            .map(|_| ReadShard {
                active: AtomicUsize::new(0),
            })
            .collect();
        Self {
            mask: shards.len() - 1,
            shards,
            v4: AtomicPtr::new(std::ptr::null_mut()),
            v6: AtomicPtr::new(std::ptr::null_mut()),
            _owned: PhantomData,
        }
    }

    /// Enter a read section. The published values stay safe to dereference
    /// until the returned guard is dropped.
    pub fn read(&self) -> ReadSection<'_, T> {
        let shard = counter::shard_index() & self.mask;
        // SeqCst pairs with the SeqCst swap in `swap`: either the writer sees
        // this reader's increment during its grace wait, or the reader sees
        // the new pointer.
        self.shards[shard].active.fetch_add(1, Ordering::SeqCst);
        ReadSection { pair: self, shard }
    }

    /// Publish a new v4 value, returning the displaced one. The caller holds
    /// the exclusive update lock and must wait out [`Self::synchronize`]
    /// before tearing the old value down.
    pub fn swap_v4(&self, new: Option<Arc<T>>) -> Option<Arc<T>> {
        Self::swap_slot(&self.v4, new)
    }

    pub fn swap_v6(&self, new: Option<Arc<T>>) -> Option<Arc<T>> {
        Self::swap_slot(&self.v6, new)
    }

    fn swap_slot(slot: &AtomicPtr<T>, new: Option<Arc<T>>) -> Option<Arc<T>> {
        let raw = match new {
            Some(value) => Arc::into_raw(value).cast_mut(),
            None => std::ptr::null_mut(),
        };
        let old = slot.swap(raw, Ordering::SeqCst);
        if old.is_null() {
            None
        } else {
            // Safety: non-null slot values are always `Arc::into_raw` results
            // and the swap transferred ownership back to us.
            Some(unsafe { Arc::from_raw(old) })
        }
    }

    /// Wait for a grace period: every read section entered before the most
    /// recent swap has been exited once this returns.
    pub fn synchronize(&self) {
        for shard in self.shards.iter() {
            let mut spins = 0u32;
            // A shard observed at zero holds no reader that predates the
            // swap; readers entering afterwards see the new pointers.
            while shard.active.load(Ordering::SeqCst) != 0 {
                spins += 1;
                if spins % 64 == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl<T> Drop for RcuPair<T> {
    fn drop(&mut self) {
        for slot in [&self.v4, &self.v6] {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::SeqCst);
            if !raw.is_null() {
                // Safety: same ownership transfer as in `swap_slot`.
                drop(unsafe { Arc::from_raw(raw) });
            }
        }
    }
}

/// An active read section. Values borrowed from it must not outlive it.
pub(crate) struct ReadSection<'a, T> {
    pair: &'a RcuPair<T>,
    shard: usize,
}

impl<'a, T: Send + Sync> ReadSection<'a, T> {
    pub fn for_family(&self, family: Family) -> Option<&T> {
        let slot = match family {
            Family::V4 => &self.pair.v4,
            Family::V6 => &self.pair.v6,
        };
        let raw = slot.load(Ordering::SeqCst);
        // Safety: the pointer was published via `Arc::into_raw` and cannot be
        // dropped before `synchronize` observes this section's exit.
        unsafe { raw.as_ref() }
    }

    pub fn v4(&self) -> Option<&T> {
        self.for_family(Family::V4)
    }

    pub fn v6(&self) -> Option<&T> {
        self.for_family(Family::V6)
    }
}

impl<'a, T> Drop for ReadSection<'a, T> {
    fn drop(&mut self) {
        self.pair.shards[self.shard]
            .active
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn publish_and_read_back() {
        let pair: RcuPair<String> = RcuPair::new(4);
        assert!(pair.read().v4().is_none());

        assert!(pair.swap_v4(Some(Arc::new("sock4".into()))).is_none());
        assert!(pair.swap_v6(Some(Arc::new("sock6".into()))).is_none());

        let section = pair.read();
        assert_eq!(section.v4().unwrap(), "sock4");
        assert_eq!(section.for_family(Family::V6).unwrap(), "sock6");
    }

    #[test]
    fn swap_returns_displaced_value() {
        let pair: RcuPair<u32> = RcuPair::new(1);
        pair.swap_v4(Some(Arc::new(1)));
        let old = pair.swap_v4(Some(Arc::new(2))).unwrap();
        assert_eq!(*old, 1);
        assert_eq!(*pair.read().v4().unwrap(), 2);
        assert!(pair.swap_v4(None).is_some());
        assert!(pair.read().v4().is_none());
    }

    #[test]
    fn synchronize_waits_for_active_readers() {
        let pair: Arc<RcuPair<u32>> = Arc::new(RcuPair::new(2));
        pair.swap_v4(Some(Arc::new(7)));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let reader = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let section = pair.read();
                let value = *section.v4().unwrap();
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                drop(section);
                value
            })
        };
        entered_rx.recv().unwrap();

        let old = pair.swap_v4(None).unwrap();
        let synced = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pair = Arc::clone(&pair);
            let synced = Arc::clone(&synced);
            thread::spawn(move || {
                pair.synchronize();
                synced.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(
            !synced.load(Ordering::SeqCst),
            "grace period ended with a reader still inside"
        );

        release_tx.send(()).unwrap();
        assert_eq!(reader.join().unwrap(), 7);
        waiter.join().unwrap();
        assert!(synced.load(Ordering::SeqCst));
        drop(old);
    }
}

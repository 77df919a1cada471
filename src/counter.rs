//! Sharded counters for the hot send and receive paths.
//!
//! A [`CounterGroup`] packs up to 16 counters into a set of cache lines, with
//! each thread writing to its own shard so concurrent senders never contend on
//! a line. Groups back both the process-wide metrics in [`crate::metrics`]
//! and the per-device statistics block.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const CACHE_LINE: usize = 128;
const SLOTS: usize = CACHE_LINE / 8;
const NUM_SHARDS: usize = 64;

thread_local! {
    static SHARD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the current thread to a shard.
///
/// Worker threads should call this once at startup for deterministic shard
/// assignment; threads that never do fall back to a hash of a TLS address.
pub fn set_thread_shard(id: usize) {
    SHARD_ID.set(Some(id % NUM_SHARDS));
}

/// Shard index for the current thread. Also used to pick the read-section
/// shard in the socket registry so a thread touches one line for both.
#[inline]
pub(crate) fn shard_index() -> usize {
    SHARD_ID.get().unwrap_or_else(|| {
        thread_local! {
            static ID: u8 = const { 0 };
        }
        ID.with(|x| x as *const u8 as usize) % NUM_SHARDS
    })
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        Self {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    pub(crate) fn increment(&self, slot: usize) {
        self.add(slot, 1);
    }

    #[inline]
    pub(crate) fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter referencing one slot of a static [`CounterGroup`], registerable
/// with metriken for Prometheus exposition.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.increment(self.slot);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current value, aggregated across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

//! Rundown protection: counts in-flight work against an object and blocks its
//! teardown until every acquirer has released.

use std::sync::atomic::{AtomicUsize, Ordering};

const CLOSING: usize = 1;
const ONE: usize = 2;

/// Refcount-like teardown gate.
///
/// `acquire` fails once a closer has arrived, so no new work can start while
/// [`Rundown::wait_for_release`] drains the existing acquirers.
pub struct Rundown {
    // Bit 0: closing. Remaining bits: acquirer count.
    state: AtomicUsize,
}

impl Rundown {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Try to register in-flight work. Fails if teardown has begun.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & CLOSING != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => state = observed,
            }
        }
    }

    /// Release one acquisition.
    pub fn release(&self) {
        let prev = self.state.fetch_sub(ONE, Ordering::Release);
        debug_assert!(prev >= ONE, "rundown release without acquire");
    }

    /// Begin teardown and block until all acquirers have released.
    pub fn wait_for_release(&self) {
        self.state.fetch_or(CLOSING, Ordering::Acquire);
        let mut spins = 0u32;
        while self.state.load(Ordering::Acquire) & !CLOSING != 0 {
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        (self.state.load(Ordering::Relaxed) & !CLOSING) / ONE
    }
}

impl Default for Rundown {
    fn default() -> Self {
        Self::new()
    }
}

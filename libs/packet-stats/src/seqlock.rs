//! Single-writer sequence lock.
//!
//! Shard statistics have exactly one writer (the owning worker) and
//! occasional readers on the API path. The writer bumps the sequence
//! around each mutation; readers retry until they observe a stable,
//! even sequence, so snapshots are tear-free without blocking the hot
//! path on a lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering, fence};

#[derive(Debug, Default)]
pub struct SeqLock<T> {
    seq: AtomicU64,
    value: UnsafeCell<T>,
}

// Readers only ever clone out of `value` after proving quiescence via
// the sequence; the single-writer contract is upheld by shard ownership.
unsafe impl<T: Send> Send for SeqLock<T> {}
unsafe impl<T: Send> Sync for SeqLock<T> {}

impl<T> SeqLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Mutates the value. Must only be called from the owning writer.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.seq.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);

        // Safety: single writer by contract; readers never take
        // references, they copy out under the sequence check.
        let result = f(unsafe { &mut *self.value.get() });

        self.seq.fetch_add(1, Ordering::Release);
        result
    }
}

impl<T: Clone> SeqLock<T> {
    /// Copies the value out, retrying while a write is in flight.
    pub fn read(&self) -> T {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let value = unsafe { (*self.value.get()).clone() };

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return value;
            }
        }
    }
}

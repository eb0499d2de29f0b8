//! Per-thread worker identity.
//!
//! Each I/O worker registers its id once at startup; sinks and sources
//! use it to select the shard they own.

use std::cell::Cell;

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

pub fn set_id(id: usize) {
    WORKER_ID.with(|slot| slot.set(id));
}

pub fn get_id() -> usize {
    WORKER_ID.with(|slot| slot.get())
}

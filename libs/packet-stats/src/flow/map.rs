//! Single-writer, multi-reader flow table with epoch-based
//! reclamation.
//!
//! The owning worker inserts and updates; result readers iterate
//! concurrently without locks. Replaced or removed nodes and retired
//! tables are queued with the writer version current at unlink time and
//! freed only once every pinned reader has checkpointed past that
//! version, so a reader never dereferences freed memory. The writer
//! drains the queue after each burst.

use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::flow::{FlowCounters, FlowKey};
use crate::seqlock::SeqLock;

/// Maximum concurrently registered readers per shard.
pub const MAX_READERS: usize = 16;

const IDLE: u64 = u64::MAX;
const MIN_CAPACITY: usize = 64;

fn tombstone<T>() -> *mut T {
    usize::MAX as *mut T
}

pub struct FlowNode {
    pub key: FlowKey,
    pub counters: SeqLock<FlowCounters>,
}

struct Table {
    mask: usize,
    buckets: Box<[AtomicPtr<FlowNode>]>,
}

impl Table {
    fn new(capacity: usize) -> Box<Table> {
        let buckets = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Table {
            mask: capacity - 1,
            buckets,
        })
    }
}

enum Retired {
    Node(*mut FlowNode),
    Table(*mut Table),
}

// Retired pointers are owned exclusively by the reclamation queue.
unsafe impl Send for Retired {}

impl Retired {
    /// Frees the retired allocation.
    ///
    /// # Safety
    ///
    /// Must only be called once no reader can still hold the pointer,
    /// i.e. after every pinned reader has advanced past the retire
    /// version.
    unsafe fn release(self) {
        match self {
            Retired::Node(node) => drop(unsafe { Box::from_raw(node) }),
            Retired::Table(table) => drop(unsafe { Box::from_raw(table) }),
        }
    }
}

/// Claim on a reader slot; obtained from [`FlowMap::add_reader`].
#[derive(Debug)]
pub struct ReaderId(usize);

pub struct FlowMap {
    table: AtomicPtr<Table>,
    len: AtomicUsize,
    tombstones: AtomicUsize,
    hasher: ahash::RandomState,
    writer_version: AtomicU64,
    reader_versions: [AtomicU64; MAX_READERS],
    reader_slots: [AtomicBool; MAX_READERS],
    retired: Mutex<Vec<(u64, Retired)>>,
}

// The map only hands out owned snapshots to readers; all shared state
// is accessed through atomics or the retire mutex.
unsafe impl Send for FlowMap {}
unsafe impl Sync for FlowMap {}

impl Default for FlowMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowMap {
    pub fn new() -> Self {
        Self {
            table: AtomicPtr::new(Box::into_raw(Table::new(MIN_CAPACITY))),
            len: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            hasher: ahash::RandomState::new(),
            writer_version: AtomicU64::new(0),
            reader_versions: [const { AtomicU64::new(IDLE) }; MAX_READERS],
            reader_slots: [const { AtomicBool::new(false) }; MAX_READERS],
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(&self, key: &FlowKey) -> usize {
        use std::hash::BuildHasher;
        self.hasher.hash_one(key) as usize
    }

    fn current(&self) -> &Table {
        // Safety: the current table is never freed before the map; a
        // superseded table goes through the retire queue.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    /// Looks a flow up. Writer-side: the returned pointer stays valid
    /// until the writer itself retires the node.
    pub fn find(&self, key: &FlowKey) -> Option<NonNull<FlowNode>> {
        let table = self.current();
        let mut idx = self.hash(key) & table.mask;

        loop {
            let bucket = table.buckets[idx].load(Ordering::Acquire);
            if bucket.is_null() {
                return None;
            }
            if bucket != tombstone() {
                let node = unsafe { &*bucket };
                if node.key == *key {
                    return NonNull::new(bucket);
                }
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// Inserts a flow, replacing any previous node for the key. A
    /// replaced node is retired, not freed. Must only be called by the
    /// owning writer.
    pub fn insert(&self, key: FlowKey, counters: FlowCounters) {
        self.reserve_one();

        let node = Box::into_raw(Box::new(FlowNode {
            key,
            counters: SeqLock::new(counters),
        }));

        let table = self.current();
        let mut idx = self.hash(&key) & table.mask;
        let mut reuse: Option<usize> = None;

        loop {
            let bucket = table.buckets[idx].load(Ordering::Acquire);
            if bucket.is_null() {
                let slot = reuse.unwrap_or(idx);
                if reuse.is_some() {
                    self.tombstones.fetch_sub(1, Ordering::Relaxed);
                }
                table.buckets[slot].store(node, Ordering::Release);
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if bucket == tombstone() {
                reuse.get_or_insert(idx);
            } else if unsafe { &*bucket }.key == key {
                table.buckets[idx].store(node, Ordering::Release);
                self.retire(Retired::Node(bucket));
                return;
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// Removes a flow; the node is retired, not freed. Must only be
    /// called by the owning writer.
    pub fn remove(&self, key: &FlowKey) -> bool {
        let table = self.current();
        let mut idx = self.hash(key) & table.mask;

        loop {
            let bucket = table.buckets[idx].load(Ordering::Acquire);
            if bucket.is_null() {
                return false;
            }
            if bucket != tombstone() && unsafe { &*bucket }.key == *key {
                table.buckets[idx].store(tombstone(), Ordering::Release);
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.tombstones.fetch_add(1, Ordering::Relaxed);
                self.retire(Retired::Node(bucket));
                return true;
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// Grows (or compacts) the table before an insert when occupancy
    /// would cross half full.
    fn reserve_one(&self) {
        let table = self.current();
        let capacity = table.mask + 1;
        let occupied = self.len.load(Ordering::Relaxed)
            + self.tombstones.load(Ordering::Relaxed);

        if (occupied + 1) * 2 <= capacity {
            return;
        }

        let new_capacity = if (self.len.load(Ordering::Relaxed) + 1) * 2 > capacity {
            capacity * 2
        } else {
            capacity
        };

        let mut new_table = Table::new(new_capacity);
        for bucket in table.buckets.iter() {
            let node = bucket.load(Ordering::Acquire);
            if node.is_null() || node == tombstone() {
                continue;
            }
            let key = unsafe { &(*node).key };
            let mut idx = self.hash(key) & new_table.mask;
            while !new_table.buckets[idx].load(Ordering::Relaxed).is_null() {
                idx = (idx + 1) & new_table.mask;
            }
            // The new table is private until published.
            new_table.buckets[idx].store(node, Ordering::Relaxed);
        }

        let old = self.table.swap(Box::into_raw(new_table), Ordering::AcqRel);
        self.tombstones.store(0, Ordering::Relaxed);
        self.retire(Retired::Table(old));
    }

    fn retire(&self, item: Retired) {
        let version = self.writer_version.fetch_add(1, Ordering::Release);
        self.retired
            .lock()
            .expect("retire queue poisoned")
            .push((version, item));
    }

    /// Frees retired allocations no pinned reader can still observe.
    /// Called by the writer after each burst.
    pub fn process_gc(&self) {
        // Order the preceding unlinks and retires before the reader
        // slot scan; pairs with the fence in `pin`.
        std::sync::atomic::fence(Ordering::SeqCst);

        let min = self
            .reader_versions
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .min()
            .unwrap_or(IDLE);

        let mut queue = self.retired.lock().expect("retire queue poisoned");
        let mut idx = 0;
        while idx < queue.len() {
            if queue[idx].0 < min {
                let (_, item) = queue.swap_remove(idx);
                // Safety: every reader checkpointed after this item was
                // unlinked (or is idle).
                unsafe { item.release() };
            } else {
                idx += 1;
            }
        }
    }

    /// Claims a reader slot; `None` when all slots are taken.
    pub fn add_reader(&self) -> Option<ReaderId> {
        for (idx, slot) in self.reader_slots.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ReaderId(idx));
            }
        }
        None
    }

    pub fn remove_reader(&self, reader: ReaderId) {
        self.reader_versions[reader.0].store(IDLE, Ordering::Release);
        self.reader_slots[reader.0].store(false, Ordering::Release);
    }

    /// Pins a reader at the current version for the guard's lifetime.
    pub fn pin<'a>(&'a self, reader: &ReaderId) -> ReadGuard<'a> {
        // Publish the pin, then confirm no retire slipped in between
        // reading the version and publishing it; a retire that runs
        // after the fence observes the pinned slot.
        loop {
            let version = self.writer_version.load(Ordering::SeqCst);
            self.reader_versions[reader.0].store(version, Ordering::SeqCst);
            std::sync::atomic::fence(Ordering::SeqCst);
            if self.writer_version.load(Ordering::SeqCst) == version {
                break;
            }
        }

        ReadGuard {
            map: self,
            slot: reader.0,
        }
    }
}

impl Drop for FlowMap {
    fn drop(&mut self) {
        let table = self.table.load(Ordering::Relaxed);
        let table = unsafe { Box::from_raw(table) };
        for bucket in table.buckets.iter() {
            let node = bucket.load(Ordering::Relaxed);
            if !node.is_null() && node != tombstone() {
                drop(unsafe { Box::from_raw(node) });
            }
        }

        for (_, item) in self
            .retired
            .lock()
            .expect("retire queue poisoned")
            .drain(..)
        {
            unsafe { item.release() };
        }
    }
}

/// Keeps the owning reader's epoch pinned; flows are yielded as owned
/// snapshots.
pub struct ReadGuard<'a> {
    map: &'a FlowMap,
    slot: usize,
}

impl ReadGuard<'_> {
    /// Iterates over the map's current flows.
    pub fn iter(&self) -> impl Iterator<Item = (FlowKey, FlowCounters)> + '_ {
        let table = self.map.current();
        table.buckets.iter().filter_map(|bucket| {
            let node = bucket.load(Ordering::Acquire);
            if node.is_null() || node == tombstone() {
                return None;
            }
            let node = unsafe { &*node };
            Some((node.key, node.counters.read()))
        })
    }

    /// Snapshot of one flow's counters.
    pub fn get(&self, key: &FlowKey) -> Option<FlowCounters> {
        let table = self.map.current();
        let mut idx = self.map.hash(key) & table.mask;

        loop {
            let bucket = table.buckets[idx].load(Ordering::Acquire);
            if bucket.is_null() {
                return None;
            }
            if bucket != tombstone() {
                let node = unsafe { &*bucket };
                if node.key == *key {
                    return Some(node.counters.read());
                }
            }
            idx = (idx + 1) & table.mask;
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.map.reader_versions[self.slot].store(IDLE, Ordering::Release);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffer metadata table with cross-process atomic reference counts.
//!
//! One [`BufferMeta`] slot describes one live buffer: which pool block
//! holds its bytes, how many handles and unread queue entries reference
//! it, and its timestamps. The table is a fixed array embedded in the
//! global registry segment, with a LIFO free-slot list guarded by a
//! cross-process mutex.
//!
//! # Slot state machine
//!
//! ```text
//! free -> reserved (refcount=0, valid=false)    allocate_slot
//!      -> live     (refcount=1, valid=true)     producer publishes
//!      -> draining (refcount=0, valid=false)    last handle dropped
//!      -> free                                  zero-observer frees slot
//! ```
//!
//! Only the producing process performs reserved->live; any process may
//! drop the last reference; only the process that observes the zero
//! transition performs draining->free.
//!
//! # Memory Ordering
//!
//! `add_ref`/`remove_ref` are acquire-release so that the transition to
//! zero happens-after every handle drop. `valid` is published with
//! release and read with acquire: a reader that observes `valid=true`
//! also observes every plain field the producer wrote before it.
//! `find_slot_by_id` is a lock-free scan - refcount traffic never takes
//! the table mutex.
//!
//! Buffer ids are handed out by a monotone 64-bit counter and never
//! recycled; a stale id simply stops matching any slot.

use crate::config::MAX_BUFFERS;
use crate::sync::ShmMutex;
use crate::timestamp::{TimeRange, Timestamp};
use crate::{BufferId, PoolId, ProcessId};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Metadata for one buffer. Cache-line aligned to avoid false sharing
/// between the refcounts of neighbouring buffers.
#[repr(C, align(64))]
pub struct BufferMeta {
    /// Globally unique buffer id; 0 when the slot is free
    buffer_id: AtomicU64,
    /// Requested size in bytes (not the pool block size)
    size: AtomicU64,
    /// Offset of the data from the pool segment base
    data_shm_offset: AtomicU64,
    /// Single-point timestamp, nanoseconds
    timestamp: AtomicU64,
    /// Optional time range
    time_range_start: AtomicU64,
    time_range_end: AtomicU64,
    /// Allocation time, nanoseconds
    alloc_time_ns: AtomicU64,
    /// Cross-process reference count
    refcount: AtomicU32,
    /// Pool holding the data block
    pool_id: AtomicU32,
    /// Block index within the pool
    block_index: AtomicU32,
    /// Process that allocated the buffer
    creator_process: AtomicU32,
    /// Whether the slot describes a live buffer
    valid: AtomicBool,
    /// Whether `time_range_*` is meaningful
    has_time_range: AtomicBool,
    _pad: [u8; 6],
}

impl BufferMeta {
    /// Atomically increment the reference count; returns the new count.
    #[inline]
    pub fn add_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Atomically decrement the reference count; returns the new count.
    ///
    /// A return of 0 is the live -> draining transition of the slot
    /// state machine: exactly one caller observes it, and that caller
    /// owns the teardown (clear `valid`, free the slot, then the pool
    /// block). No other process may touch the slot in between - the id
    /// stops matching lookups once `valid` drops.
    #[inline]
    pub fn remove_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Current reference count.
    #[inline]
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Whether the slot describes a live buffer.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Publish or retract validity.
    #[inline]
    pub fn set_valid(&self, v: bool) {
        self.valid.store(v, Ordering::Release);
    }

    /// Buffer id stored in this slot (0 when free).
    #[inline]
    #[must_use]
    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id.load(Ordering::Acquire)
    }

    /// Pool that holds the data block.
    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id.load(Ordering::Acquire)
    }

    /// Block index within the pool.
    #[must_use]
    pub fn block_index(&self) -> u32 {
        self.block_index.load(Ordering::Acquire)
    }

    /// Requested buffer size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Offset of the data from the pool segment base.
    #[must_use]
    pub fn data_shm_offset(&self) -> u64 {
        self.data_shm_offset.load(Ordering::Acquire)
    }

    /// Process that allocated the buffer.
    #[must_use]
    pub fn creator_process(&self) -> ProcessId {
        self.creator_process.load(Ordering::Acquire)
    }

    /// Allocation time in nanoseconds.
    #[must_use]
    pub fn alloc_time_ns(&self) -> u64 {
        self.alloc_time_ns.load(Ordering::Acquire)
    }

    /// Single-point timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_nanos(self.timestamp.load(Ordering::Acquire))
    }

    /// Set the single-point timestamp.
    pub fn set_timestamp(&self, ts: Timestamp) {
        self.timestamp.store(ts.to_nanos(), Ordering::Release);
    }

    /// Time range, if one was set.
    #[must_use]
    pub fn time_range(&self) -> Option<TimeRange> {
        if !self.has_time_range.load(Ordering::Acquire) {
            return None;
        }
        Some(TimeRange::new(
            self.time_range_start.load(Ordering::Acquire),
            self.time_range_end.load(Ordering::Acquire),
        ))
    }

    /// Attach a time range.
    pub fn set_time_range(&self, range: TimeRange) {
        self.time_range_start
            .store(range.start_ns, Ordering::Relaxed);
        self.time_range_end.store(range.end_ns, Ordering::Relaxed);
        self.has_time_range.store(true, Ordering::Release);
    }

    /// Transition reserved -> live: record where the data lives, take the
    /// initial reference, publish validity last.
    pub fn publish(
        &self,
        pool_id: PoolId,
        block_index: u32,
        size: u64,
        data_shm_offset: u64,
        creator: ProcessId,
    ) {
        self.pool_id.store(pool_id, Ordering::Relaxed);
        self.block_index.store(block_index, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.data_shm_offset.store(data_shm_offset, Ordering::Relaxed);
        self.creator_process.store(creator, Ordering::Relaxed);
        self.alloc_time_ns
            .store(Timestamp::now().to_nanos(), Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
        self.has_time_range.store(false, Ordering::Relaxed);
        self.refcount.store(1, Ordering::Release);
        self.set_valid(true);
    }

    fn clear(&self) {
        self.valid.store(false, Ordering::Relaxed);
        self.buffer_id.store(0, Ordering::Relaxed);
        self.refcount.store(0, Ordering::Relaxed);
        self.has_time_range.store(false, Ordering::Relaxed);
    }
}

/// Fixed-capacity table of buffer metadata slots.
///
/// Lives inside the global registry segment; never constructed by value.
#[repr(C)]
pub struct MetadataTable {
    /// Guards the free-slot list
    mutex: ShmMutex,
    /// Head of the free-slot list, -1 when exhausted
    free_head: AtomicI32,
    /// Number of allocated slots
    allocated_count: AtomicU32,
    _pad: u32,
    /// Next buffer id to hand out; starts at 1, never recycled
    next_buffer_id: AtomicU64,
    /// Metadata slots
    entries: [BufferMeta; MAX_BUFFERS],
    /// Parallel next-pointers for the free-slot list
    next_free: [AtomicI32; MAX_BUFFERS],
}

impl MetadataTable {
    /// In-place initialization, run once by the registry creator on
    /// zeroed memory.
    pub fn initialize(&self) {
        for i in 0..MAX_BUFFERS {
            self.entries[i].clear();
            let next = if i + 1 < MAX_BUFFERS {
                (i + 1) as i32
            } else {
                -1
            };
            self.next_free[i].store(next, Ordering::Relaxed);
        }
        self.allocated_count.store(0, Ordering::Relaxed);
        self.next_buffer_id.store(1, Ordering::Relaxed);
        self.free_head.store(0, Ordering::Release);
    }

    /// Reserve a slot and stamp it with a fresh buffer id.
    ///
    /// The slot comes back in the reserved state (`refcount=0`,
    /// `valid=false`); the caller publishes it once the pool block is
    /// recorded. `None` means the table is exhausted.
    pub fn allocate_slot(&self) -> Option<(u32, BufferId)> {
        let _guard = self.mutex.lock();

        let slot = self.free_head.load(Ordering::Acquire);
        if slot < 0 {
            return None;
        }

        let next = self.next_free[slot as usize].load(Ordering::Relaxed);
        self.free_head.store(next, Ordering::Release);

        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::AcqRel);

        let meta = &self.entries[slot as usize];
        meta.refcount.store(0, Ordering::Relaxed);
        meta.set_valid(false);
        meta.buffer_id.store(buffer_id, Ordering::Release);

        self.allocated_count.fetch_add(1, Ordering::Relaxed);

        Some((slot as u32, buffer_id))
    }

    /// Return a slot to the free list (draining -> free).
    pub fn free_slot(&self, slot: u32) {
        if slot as usize >= MAX_BUFFERS {
            log::warn!("[META] ignoring free of out-of-range slot {slot}");
            return;
        }

        let _guard = self.mutex.lock();

        let meta = &self.entries[slot as usize];
        meta.set_valid(false);
        meta.buffer_id.store(0, Ordering::Release);

        let old_head = self.free_head.load(Ordering::Acquire);
        self.next_free[slot as usize].store(old_head, Ordering::Relaxed);
        self.free_head.store(slot as i32, Ordering::Release);

        self.allocated_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Find the slot holding `buffer_id`.
    ///
    /// Lock-free linear scan; ids are never recycled, so a stale id
    /// simply fails to match. O(MAX_BUFFERS) is acceptable at this table
    /// size; callers cache the slot index where it matters.
    #[must_use]
    pub fn find_slot_by_id(&self, buffer_id: BufferId) -> Option<u32> {
        if buffer_id == 0 {
            return None;
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_valid() && entry.buffer_id() == buffer_id {
                return Some(i as u32);
            }
        }
        None
    }

    /// Access a slot by index.
    #[inline]
    #[must_use]
    pub fn entry(&self, slot: u32) -> &BufferMeta {
        &self.entries[slot as usize]
    }

    /// Number of currently allocated slots.
    #[must_use]
    pub fn allocated_count(&self) -> u32 {
        self.allocated_count.load(Ordering::Acquire)
    }

    /// Next buffer id that will be handed out (introspection only).
    #[must_use]
    pub fn peek_next_buffer_id(&self) -> BufferId {
        self.next_buffer_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_table() -> Box<MetadataTable> {
        // The table is designed for zeroed shared memory; a zeroed heap
        // allocation is the same starting state.
        // SAFETY: MetadataTable contains only atomics, integers and
        // padding, all of which are valid when zero-initialized.
        let table = unsafe {
            let layout = std::alloc::Layout::new::<MetadataTable>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut MetadataTable;
            assert!(!ptr.is_null());
            Box::from_raw(ptr)
        };
        table.initialize();
        table
    }

    #[test]
    fn test_meta_alignment() {
        assert_eq!(std::mem::align_of::<BufferMeta>(), 64);
        assert_eq!(std::mem::size_of::<BufferMeta>() % 64, 0);
    }

    #[test]
    fn test_allocate_free_cycle() {
        let table = boxed_table();
        assert_eq!(table.allocated_count(), 0);

        let (slot, id) = table.allocate_slot().expect("slot");
        assert_ne!(id, 0);
        assert_eq!(table.allocated_count(), 1);
        assert!(!table.entry(slot).is_valid());
        assert_eq!(table.entry(slot).refcount(), 0);

        table.free_slot(slot);
        assert_eq!(table.allocated_count(), 0);
        assert_eq!(table.entry(slot).buffer_id(), 0);
    }

    #[test]
    fn test_buffer_ids_monotone_never_recycled() {
        let table = boxed_table();
        let (s1, id1) = table.allocate_slot().unwrap();
        table.free_slot(s1);
        let (s2, id2) = table.allocate_slot().unwrap();
        // LIFO free list reuses the slot, never the id
        assert_eq!(s1, s2);
        assert!(id2 > id1);
    }

    #[test]
    fn test_find_by_id_only_sees_valid() {
        let table = boxed_table();
        let (slot, id) = table.allocate_slot().unwrap();

        // Reserved but not yet published: invisible
        assert_eq!(table.find_slot_by_id(id), None);

        table.entry(slot).publish(0, 3, 100, 4096, 1);
        assert_eq!(table.find_slot_by_id(id), Some(slot));
        assert_eq!(table.entry(slot).refcount(), 1);
        assert_eq!(table.entry(slot).size(), 100);
        assert_eq!(table.entry(slot).block_index(), 3);

        table.entry(slot).set_valid(false);
        assert_eq!(table.find_slot_by_id(id), None);
        assert_eq!(table.find_slot_by_id(0), None);
    }

    #[test]
    fn test_exhaustion() {
        let table = boxed_table();
        let mut slots = Vec::new();
        while let Some((slot, _)) = table.allocate_slot() {
            slots.push(slot);
        }
        assert_eq!(slots.len(), MAX_BUFFERS);
        assert_eq!(table.allocated_count(), MAX_BUFFERS as u32);

        for slot in slots {
            table.free_slot(slot);
        }
        assert_eq!(table.allocated_count(), 0);
        assert!(table.allocate_slot().is_some());
    }

    #[test]
    fn test_refcount_transitions() {
        let table = boxed_table();
        let (slot, _) = table.allocate_slot().unwrap();
        let meta = table.entry(slot);
        meta.publish(0, 0, 8, 64, 1);

        assert_eq!(meta.add_ref(), 2);
        assert_eq!(meta.add_ref(), 3);
        assert_eq!(meta.remove_ref(), 2);
        assert_eq!(meta.remove_ref(), 1);
        assert_eq!(meta.remove_ref(), 0);
    }

    #[test]
    fn test_timestamps_on_slot() {
        let table = boxed_table();
        let (slot, _) = table.allocate_slot().unwrap();
        let meta = table.entry(slot);
        meta.publish(0, 0, 8, 64, 1);

        assert!(!meta.timestamp().is_valid());
        meta.set_timestamp(Timestamp::from_nanos(42));
        assert_eq!(meta.timestamp().to_nanos(), 42);

        assert!(meta.time_range().is_none());
        meta.set_time_range(TimeRange::new(10, 20));
        assert_eq!(meta.time_range(), Some(TimeRange::new(10, 20)));
    }

    #[test]
    fn test_concurrent_slot_churn() {
        use std::sync::Arc;
        let table: Arc<MetadataTable> = Arc::from(boxed_table());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let (slot, id) = table.allocate_slot().expect("table large enough");
                    let meta = table.entry(slot);
                    meta.publish(0, slot, 8, 64, 1);
                    assert_eq!(table.find_slot_by_id(id), Some(slot));
                    assert_eq!(meta.remove_ref(), 0);
                    meta.set_valid(false);
                    table.free_slot(slot);
                }
            }));
        }
        for h in handles {
            h.join().expect("churn thread panicked");
        }
        assert_eq!(table.allocated_count(), 0);
    }
}

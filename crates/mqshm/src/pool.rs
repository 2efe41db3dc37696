// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size block pools in shared memory.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | PoolHeader (64 bytes, cache-aligned)                         |
//! +--------------------------------------------------------------+
//! | free_list[block_count] (i32 next-indices, -1 terminates)     |
//! +--------------------------------------------------------------+
//! | data[block_count x block_size]   (8-byte aligned)            |
//! +--------------------------------------------------------------+
//! ```
//!
//! The free list is LIFO: freshly freed blocks are handed out first while
//! their lines are still warm. Allocation and release are two pointer
//! swaps under the pool mutex; a lock-free list is deliberately avoided
//! because cross-process ABA-safe CAS costs more than this critical
//! section.
//!
//! Block data is never zeroed on free; producers own the content they
//! write. Block addresses are naturally aligned for `u64`; callers must
//! not assume more.

use crate::config::{SHM_MAGIC, SHM_VERSION};
use crate::error::{Result, ShmError};
use crate::segment::{wait_initialized, ShmSegment};
use crate::sync::ShmMutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Pool header at offset 0 of the pool segment. Exactly one cache line.
#[repr(C, align(64))]
pub struct PoolHeader {
    /// Magic number ("MQSH")
    magic: u32,
    /// Layout version
    version: u32,
    /// Pool id assigned by the registry
    pool_id: u32,
    _pad0: u32,
    /// Size of each block in bytes
    block_size: u64,
    /// Number of blocks
    block_count: u64,
    /// Size of this header
    header_size: u64,
    /// Offset of the data region from the segment base
    data_offset: u64,
    /// Number of blocks currently on the free list
    free_count: AtomicU32,
    /// Head of the free list, -1 when exhausted
    free_head: AtomicI32,
    /// Publication barrier: set last by the creator, release ordering
    initialized: AtomicBool,
    _pad1: [u8; 3],
    /// Guards the free list
    mutex: ShmMutex,
}

impl PoolHeader {
    fn validate(&self) -> bool {
        self.magic == SHM_MAGIC && self.version == SHM_VERSION
    }
}

const fn free_list_offset() -> usize {
    std::mem::size_of::<PoolHeader>()
}

const fn data_offset_for(block_count: usize) -> usize {
    let raw = free_list_offset() + block_count * std::mem::size_of::<i32>();
    (raw + 7) & !7
}

/// Total segment size for a pool with the given geometry.
#[must_use]
pub const fn pool_segment_size(block_size: usize, block_count: usize) -> usize {
    data_offset_for(block_count) + block_size * block_count
}

/// A fixed-size block pool backed by one shared-memory segment.
///
/// The `BufferPool` value is a process-local view; any number of
/// processes can hold views of the same segment concurrently.
pub struct BufferPool {
    segment: ShmSegment,
}

impl BufferPool {
    /// Create the pool segment and initialize its free list.
    ///
    /// # Errors
    ///
    /// `SegmentExists` if the name is taken, `InvalidCapacity` for a
    /// degenerate geometry.
    pub fn create(name: &str, pool_id: u32, block_size: usize, block_count: usize) -> Result<Self> {
        if block_size == 0 || block_count == 0 || block_count > i32::MAX as usize {
            return Err(ShmError::InvalidCapacity(block_count.max(block_size)));
        }

        let total = pool_segment_size(block_size, block_count);
        let segment = ShmSegment::create(name, total)?;

        // SAFETY: the segment was just created with exclusive access
        // (O_EXCL) and is at least size_of::<PoolHeader>() bytes; mmap
        // returns page-aligned memory which satisfies the 64-byte
        // alignment. No other process can observe the header until
        // `initialized` is published below.
        let header = unsafe { &mut *(segment.as_ptr() as *mut PoolHeader) };
        header.magic = SHM_MAGIC;
        header.version = SHM_VERSION;
        header.pool_id = pool_id;
        header.block_size = block_size as u64;
        header.block_count = block_count as u64;
        header.header_size = free_list_offset() as u64;
        header.data_offset = data_offset_for(block_count) as u64;

        let pool = Self { segment };

        // Chain every block: free_list[i] = i+1, last entry terminates.
        let free_list = pool.free_list();
        for i in 0..block_count {
            let next = if i + 1 < block_count {
                (i + 1) as i32
            } else {
                -1
            };
            // SAFETY: i < block_count; the free list array has exactly
            // block_count entries starting at free_list_offset().
            unsafe { (*free_list.add(i)).store(next, Ordering::Relaxed) };
        }
        pool.header().free_head.store(0, Ordering::Relaxed);
        pool.header()
            .free_count
            .store(block_count as u32, Ordering::Relaxed);

        pool.header().initialized.store(true, Ordering::Release);

        log::debug!(
            "[POOL] created {name}: pool_id={pool_id} block_size={block_size} block_count={block_count}"
        );

        Ok(pool)
    }

    /// Open an existing pool segment.
    ///
    /// Waits for the creator's publication barrier, then validates magic
    /// and version.
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        if segment.size() < std::mem::size_of::<PoolHeader>() {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        let pool = Self { segment };
        wait_initialized(&pool.header().initialized, name)?;
        if !pool.header().validate() {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        // A creator built with different capacity constants would lay the
        // free list out elsewhere; refuse rather than misread it.
        if pool.header().header_size != free_list_offset() as u64 {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        let expected =
            pool_segment_size(pool.block_size(), pool.block_count());
        if pool.segment.size() < expected {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        Ok(pool)
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        // SAFETY: the segment is at least size_of::<PoolHeader>() bytes
        // (checked in create/open) and page-aligned; all mutable header
        // fields are atomics or guarded by the pool mutex.
        unsafe { &*(self.segment.as_ptr() as *const PoolHeader) }
    }

    #[inline]
    fn free_list(&self) -> *const AtomicI32 {
        // SAFETY: the free list starts at free_list_offset(), within the
        // segment by construction; 4-byte alignment follows from the
        // 64-byte header.
        unsafe { self.segment.as_ptr().add(free_list_offset()) as *const AtomicI32 }
    }

    #[inline]
    fn data_base(&self) -> *mut u8 {
        // SAFETY: data_offset is within the segment by construction.
        unsafe { self.segment.as_ptr().add(self.header().data_offset as usize) }
    }

    /// Pop a block off the free list. `None` means the pool is exhausted,
    /// which is a normal, non-fatal condition.
    pub fn allocate_block(&self) -> Option<u32> {
        let header = self.header();
        let _guard = header.mutex.lock();

        let index = header.free_head.load(Ordering::Acquire);
        if index < 0 {
            return None;
        }

        // SAFETY: index came off the free list, so 0 <= index < block_count.
        let next = unsafe { (*self.free_list().add(index as usize)).load(Ordering::Relaxed) };
        header.free_head.store(next, Ordering::Release);
        header.free_count.fetch_sub(1, Ordering::Relaxed);

        Some(index as u32)
    }

    /// Push a block back onto the free list.
    ///
    /// Out-of-range indices are ignored defensively (a buggy peer must
    /// not corrupt the list).
    pub fn free_block(&self, index: u32) {
        let header = self.header();
        if u64::from(index) >= header.block_count {
            log::warn!(
                "[POOL] ignoring free of out-of-range block {index} (pool {})",
                header.pool_id
            );
            return;
        }

        let _guard = header.mutex.lock();

        let old_head = header.free_head.load(Ordering::Acquire);
        // SAFETY: index < block_count was checked above.
        unsafe { (*self.free_list().add(index as usize)).store(old_head, Ordering::Relaxed) };
        header.free_head.store(index as i32, Ordering::Release);
        header.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Process-local pointer to a block's data.
    #[must_use]
    pub fn block_ptr(&self, index: u32) -> Option<*mut u8> {
        let header = self.header();
        if u64::from(index) >= header.block_count {
            return None;
        }
        // SAFETY: index < block_count, so the offset stays inside the
        // data region sized block_size * block_count.
        Some(unsafe {
            self.data_base()
                .add(index as usize * header.block_size as usize)
        })
    }

    /// Offset of a block's data from the segment base (stable across
    /// processes, unlike pointers).
    #[must_use]
    pub fn block_offset(&self, index: u32) -> Option<u64> {
        let header = self.header();
        if u64::from(index) >= header.block_count {
            return None;
        }
        Some(header.data_offset + u64::from(index) * header.block_size)
    }

    /// Block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.header().block_size as usize
    }

    /// Total number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.header().block_count as usize
    }

    /// Number of blocks currently free.
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.header().free_count.load(Ordering::Acquire)
    }

    /// Pool id recorded by the creator.
    #[must_use]
    pub fn pool_id(&self) -> u32 {
        self.header().pool_id
    }

    /// Segment name backing this pool.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("mqshm_test_pool_{ts}")
    }

    #[test]
    fn test_header_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<PoolHeader>(), 64);
        assert_eq!(std::mem::align_of::<PoolHeader>(), 64);
    }

    #[test]
    fn test_segment_size_is_aligned() {
        // 3 blocks -> free list ends at 64 + 12 = 76, data starts at 80
        assert_eq!(data_offset_for(3), 80);
        assert_eq!(pool_segment_size(64, 3), 80 + 192);
    }

    #[test]
    fn test_create_and_geometry() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 2, 64, 4).expect("create");
        assert_eq!(pool.pool_id(), 2);
        assert_eq!(pool.block_size(), 64);
        assert_eq!(pool.block_count(), 4);
        assert_eq!(pool.free_count(), 4);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        assert!(matches!(
            BufferPool::create("mqshm_test_pool_bad", 0, 0, 4),
            Err(ShmError::InvalidCapacity(_))
        ));
        assert!(matches!(
            BufferPool::create("mqshm_test_pool_bad", 0, 64, 0),
            Err(ShmError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_allocate_until_exhaustion() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 0, 64, 4).expect("create");

        let mut seen = Vec::new();
        for _ in 0..4 {
            let idx = pool.allocate_block().expect("block available");
            assert!(!seen.contains(&idx));
            seen.push(idx);
        }
        assert_eq!(pool.free_count(), 0);
        assert!(pool.allocate_block().is_none());

        for idx in seen {
            pool.free_block(idx);
        }
        assert_eq!(pool.free_count(), 4);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_lifo_reuse() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 0, 64, 4).expect("create");

        let a = pool.allocate_block().unwrap();
        pool.free_block(a);
        let b = pool.allocate_block().unwrap();
        assert_eq!(a, b);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_out_of_range_free_ignored() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 0, 64, 4).expect("create");
        pool.free_block(99);
        assert_eq!(pool.free_count(), 4);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_sees_creator_state() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 5, 128, 8).expect("create");
        let idx = pool.allocate_block().unwrap();

        let view = BufferPool::open(&name).expect("open");
        assert_eq!(view.pool_id(), 5);
        assert_eq!(view.block_size(), 128);
        assert_eq!(view.free_count(), 7);
        assert_eq!(view.block_offset(idx), pool.block_offset(idx));

        // Writes through one view are visible through the other
        let p1 = pool.block_ptr(idx).unwrap();
        let p2 = view.block_ptr(idx).unwrap();
        // SAFETY: idx is an allocated block of 128 bytes in both views.
        unsafe {
            *p1 = 0xAB;
            assert_eq!(*p2, 0xAB);
        }

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_block_offsets_u64_aligned() {
        let name = unique_name();
        let pool = BufferPool::create(&name, 0, 64, 4).expect("create");
        for i in 0..4 {
            assert_eq!(pool.block_offset(i).unwrap() % 8, 0);
        }
        assert!(pool.block_offset(4).is_none());
        ShmSegment::unlink(&name).ok();
    }
}

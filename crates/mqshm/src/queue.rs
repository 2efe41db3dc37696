// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast port queues.
//!
//! A port queue is a bounded ring of buffer ids in shared memory with a
//! single producer and up to [`MAX_CONSUMERS_PER_QUEUE`] consumers.
//! **Every active consumer sees every pushed id**: consumers read through
//! independent cursors, and the producer can only advance past the
//! slowest active cursor.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | PortQueueHeader (cache-aligned)                              |
//! |   tail, consumer_heads[16], consumer_active[16], owner_pid   |
//! |   mutex + not_full condvar, initialized/closed flags         |
//! +--------------------------------------------------------------+
//! | ring[capacity] (u64 buffer ids)                              |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Reference counting protocol
//!
//! On push, the queue takes one refcount unit per active consumer; each
//! pop adopts that consumer's unit into the returned handle. The
//! producer's own handle keeps its own unit throughout, so at any
//! quiescent point `refcount = live handles + unread ring entries across
//! active consumers`. Unregistering a consumer refunds the units for its
//! unread entries. With zero consumers a push stores the id but takes no
//! units; the entry is informational and nobody will ever read it.
//!
//! # Producer ownership claim
//!
//! Queue segments are single-producer. The creator stores its OS pid in
//! the header; a second `create` against a live owner fails with
//! `ProducerAlreadyLive`, while a dead owner's segment is unlinked and
//! rebuilt. On graceful drop the producer clears the pid and unlinks the
//! name.

use crate::config::{
    MAX_CONSUMERS_PER_QUEUE, POP_POLL_INTERVAL, PORT_NAME_PREFIX, SHM_MAGIC, SHM_VERSION,
};
use crate::error::{Result, ShmError};
use crate::handle::BufferHandle;
use crate::manager::BufferAllocator;
use crate::metrics::global_metrics;
use crate::process::{current_pid, process_alive};
use crate::segment::{wait_initialized_for, ShmSegment};
use crate::sync::{ShmCondvar, ShmMutex};
use crate::{BufferId, ConsumerId, PortId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a create-side probe waits for a half-built segment before
/// declaring it stale.
const PROBE_INIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Port queue header at offset 0 of the queue segment.
#[repr(C, align(64))]
struct PortQueueHeader {
    /// Magic number ("MQSH")
    magic: u32,
    /// Layout version
    version: u32,
    /// Port id this queue serves
    port_id: u32,
    _pad0: u32,
    /// Ring capacity in entries
    capacity: u64,
    /// OS pid of the producer that owns this segment; 0 = unclaimed
    owner_pid: AtomicU32,
    /// Cached count of active consumers
    consumer_count: AtomicU32,
    /// Next write position (monotone; ring index is tail % capacity)
    tail: AtomicU64,
    /// Guards ring writes, cursor updates and consumer slots
    mutex: ShmMutex,
    /// Producer wait: signalled when the slowest cursor advances
    not_full: ShmCondvar,
    /// Publication barrier
    initialized: AtomicBool,
    /// Closed flag: new pushes fail, waiters unwind
    closed: AtomicBool,
    _pad1: [u8; 6],
    /// Per-consumer read cursors (monotone)
    consumer_heads: [AtomicU64; MAX_CONSUMERS_PER_QUEUE],
    /// Per-consumer live flags
    consumer_active: [AtomicBool; MAX_CONSUMERS_PER_QUEUE],
    /// OS pid of each consumer, for the crash janitor
    consumer_pids: [AtomicU32; MAX_CONSUMERS_PER_QUEUE],
}

impl PortQueueHeader {
    fn validate(&self) -> bool {
        self.magic == SHM_MAGIC && self.version == SHM_VERSION
    }

    /// Smallest cursor over active consumers; `tail` when none are
    /// active (a producer with no audience never blocks).
    fn min_head(&self) -> u64 {
        let mut min = u64::MAX;
        for c in 0..MAX_CONSUMERS_PER_QUEUE {
            if self.consumer_active[c].load(Ordering::Acquire) {
                min = min.min(self.consumer_heads[c].load(Ordering::Acquire));
            }
        }
        if min == u64::MAX {
            self.tail.load(Ordering::Acquire)
        } else {
            min
        }
    }
}

const fn ring_offset() -> usize {
    std::mem::size_of::<PortQueueHeader>()
}

/// Total segment size for a queue of the given capacity.
#[must_use]
pub const fn queue_segment_size(capacity: usize) -> usize {
    ring_offset() + capacity * std::mem::size_of::<u64>()
}

/// Broadcast ring queue carrying buffer ids between blocks.
pub struct PortQueue {
    segment: ShmSegment,
    allocator: Arc<BufferAllocator>,
    /// Whether this process holds the producer ownership claim
    owned: bool,
}

impl PortQueue {
    /// Create a queue segment, claiming producer ownership.
    ///
    /// If the name is taken, the existing owner's pid decides: a live
    /// owner means `ProducerAlreadyLive`; a dead or absent owner's
    /// segment is unlinked and replaced.
    pub fn create(
        name: &str,
        port_id: PortId,
        capacity: usize,
        allocator: Arc<BufferAllocator>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(ShmError::InvalidCapacity(capacity));
        }

        let size = queue_segment_size(capacity);

        // Two attempts: one takeover of a stale segment, then give up.
        for attempt in 0..2 {
            match ShmSegment::create(name, size) {
                Ok(segment) => {
                    // SAFETY: freshly created zeroed segment, exclusive
                    // until `initialized` is published; large enough for
                    // the header by construction of `size`.
                    let header = unsafe { &mut *(segment.as_ptr() as *mut PortQueueHeader) };
                    header.magic = SHM_MAGIC;
                    header.version = SHM_VERSION;
                    header.port_id = port_id;
                    header.capacity = capacity as u64;
                    header.owner_pid.store(current_pid(), Ordering::Relaxed);
                    header.initialized.store(true, Ordering::Release);

                    log::debug!(
                        "[QUEUE] created {name}: port_id={port_id} capacity={capacity} owner={}",
                        current_pid()
                    );

                    return Ok(Self {
                        segment,
                        allocator,
                        owned: true,
                    });
                }
                Err(ShmError::SegmentExists(_)) if attempt == 0 => {
                    match probe_owner(name) {
                        Some(pid) if process_alive(pid) => {
                            return Err(ShmError::ProducerAlreadyLive {
                                segment: name.to_string(),
                                pid,
                            });
                        }
                        Some(pid) => {
                            log::warn!(
                                "[QUEUE] reclaiming {name} from dead producer pid {pid}"
                            );
                            ShmSegment::unlink(name)?;
                        }
                        None => {
                            log::warn!("[QUEUE] discarding stale/unclaimed segment {name}");
                            ShmSegment::unlink(name)?;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ShmError::SegmentExists(name.to_string()))
    }

    /// Open an existing queue as a consumer-side view.
    ///
    /// Waits for the creator's publication barrier and rejects segments
    /// whose producer is already dead (callers back off and retry once
    /// the producer re-creates the queue).
    pub fn open(name: &str, allocator: Arc<BufferAllocator>) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        if segment.size() < ring_offset() {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        let queue = Self {
            segment,
            allocator,
            owned: false,
        };

        let header = queue.header();
        crate::segment::wait_initialized(&header.initialized, name)?;
        if !header.validate() {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }
        if queue.segment.size() < queue_segment_size(header.capacity as usize) {
            return Err(ShmError::SegmentIncompatible(name.to_string()));
        }

        let owner = header.owner_pid.load(Ordering::Acquire);
        if owner != 0 && !process_alive(owner) {
            return Err(ShmError::SegmentIncompatible(format!(
                "{name}: producer pid {owner} is dead"
            )));
        }

        Ok(queue)
    }

    #[inline]
    fn header(&self) -> &PortQueueHeader {
        // SAFETY: the segment is at least ring_offset() bytes (checked at
        // create/open) and page-aligned; mutable header fields are
        // atomics or mutex-guarded.
        unsafe { &*(self.segment.as_ptr() as *const PortQueueHeader) }
    }

    #[inline]
    fn ring(&self) -> *const AtomicU64 {
        // SAFETY: the ring starts at ring_offset(), within the segment by
        // construction; 8-byte aligned because the header is 64-aligned.
        unsafe { self.segment.as_ptr().add(ring_offset()) as *const AtomicU64 }
    }

    #[inline]
    fn ring_entry(&self, index: u64) -> &AtomicU64 {
        let capacity = self.header().capacity;
        // SAFETY: index % capacity < capacity, and the ring has exactly
        // `capacity` entries.
        unsafe { &*self.ring().add((index % capacity) as usize) }
    }

    // ----- consumer lifecycle -----

    /// Take a consumer slot. The new cursor starts at the current tail:
    /// late subscribers see only future pushes.
    pub fn register_consumer(&self) -> Result<ConsumerId> {
        let header = self.header();
        let _guard = header.mutex.lock();

        if header.closed.load(Ordering::Acquire) {
            return Err(ShmError::Closed);
        }

        for c in 0..MAX_CONSUMERS_PER_QUEUE {
            if !header.consumer_active[c].load(Ordering::Acquire) {
                let tail = header.tail.load(Ordering::Acquire);
                header.consumer_heads[c].store(tail, Ordering::Relaxed);
                header.consumer_pids[c].store(current_pid(), Ordering::Relaxed);
                header.consumer_active[c].store(true, Ordering::Release);
                header.consumer_count.fetch_add(1, Ordering::AcqRel);
                return Ok(c as ConsumerId);
            }
        }
        Err(ShmError::OutOfSlots)
    }

    /// Release a consumer slot, refunding one refcount unit for every
    /// entry the consumer never read.
    pub fn unregister_consumer(&self, consumer: ConsumerId) -> Result<()> {
        let refunds = {
            let header = self.header();
            let _guard = header.mutex.lock();
            self.deactivate_locked(consumer)?
        };
        // Refcount updates are atomic and must not run under the queue
        // mutex (lock ordering: the release path takes pool and table
        // mutexes).
        self.refund(&refunds);
        Ok(())
    }

    /// Deactivate a consumer slot and collect its unread ids. Caller
    /// holds the queue mutex.
    fn deactivate_locked(&self, consumer: ConsumerId) -> Result<Vec<BufferId>> {
        let header = self.header();
        let c = consumer as usize;
        if c >= MAX_CONSUMERS_PER_QUEUE || !header.consumer_active[c].load(Ordering::Acquire) {
            return Err(ShmError::NotRegistered { consumer });
        }

        let tail = header.tail.load(Ordering::Acquire);
        let head = header.consumer_heads[c].load(Ordering::Acquire);
        let unread: Vec<BufferId> = (head..tail).map(|i| self.ring_entry(i).load(Ordering::Relaxed)).collect();

        header.consumer_active[c].store(false, Ordering::Release);
        header.consumer_pids[c].store(0, Ordering::Relaxed);
        header.consumer_count.fetch_sub(1, Ordering::AcqRel);

        // A slow consumer may have been the backpressure bound.
        header.not_full.notify_all();

        Ok(unread)
    }

    fn refund(&self, ids: &[BufferId]) {
        for &id in ids {
            if let Err(e) = self.allocator.remove_ref(id) {
                log::warn!("[QUEUE] refund of buffer {id}: {e}");
            }
        }
    }

    /// Janitor: unregister consumers whose recorded OS process is gone,
    /// refunding their unread entries. Returns how many slots were
    /// reclaimed. Call this from the producer side when backpressure
    /// looks stuck; it is never required for correctness of graceful
    /// peers.
    pub fn reap_dead_consumers(&self) -> usize {
        let mut all_refunds = Vec::new();
        let mut reaped = 0;
        {
            let header = self.header();
            let _guard = header.mutex.lock();
            for c in 0..MAX_CONSUMERS_PER_QUEUE {
                if !header.consumer_active[c].load(Ordering::Acquire) {
                    continue;
                }
                let pid = header.consumer_pids[c].load(Ordering::Relaxed);
                if pid != 0 && !process_alive(pid) {
                    log::warn!("[QUEUE] reaping consumer {c} of dead process pid {pid}");
                    if let Ok(ids) = self.deactivate_locked(c as ConsumerId) {
                        all_refunds.extend(ids);
                        reaped += 1;
                    }
                }
            }
        }
        self.refund(&all_refunds);
        reaped
    }

    // ----- producer side -----

    /// Broadcast a buffer to every active consumer, blocking while the
    /// ring is full.
    ///
    /// Takes one refcount unit per active consumer; the producer's handle
    /// keeps its own unit. Blocks until `tail - min(active heads) <
    /// capacity`; only [`close`](Self::close) interrupts the wait.
    pub fn push(&self, buffer: &BufferHandle) -> Result<()> {
        self.push_inner(buffer, None)
    }

    /// [`push`](Self::push) with a deadline. Expiry surfaces as
    /// `QueueFull` and leaves the queue untouched.
    pub fn push_with_timeout(&self, buffer: &BufferHandle, timeout: Duration) -> Result<()> {
        self.push_inner(buffer, Some(Instant::now() + timeout))
    }

    fn push_inner(&self, buffer: &BufferHandle, deadline: Option<Instant>) -> Result<()> {
        if !buffer.is_valid() {
            return Err(ShmError::BufferGone {
                buffer_id: buffer.id(),
            });
        }

        let header = self.header();
        let mut guard = header.mutex.lock();

        loop {
            if header.closed.load(Ordering::Acquire) {
                return Err(ShmError::Closed);
            }
            let tail = header.tail.load(Ordering::Acquire);
            if tail - header.min_head() < header.capacity {
                break;
            }
            global_metrics().inc_full_waits();
            match deadline {
                None => guard = header.not_full.wait(guard),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ShmError::QueueFull);
                    }
                    let (g, _) = header.not_full.wait_timeout(guard, d - now);
                    guard = g;
                }
            }
        }

        let tail = header.tail.load(Ordering::Acquire);
        self.ring_entry(tail).store(buffer.id(), Ordering::Relaxed);

        // One pending unit per active consumer. Under the queue mutex no
        // consumer can pop (and drop) these units before they exist.
        let consumers = header.consumer_count.load(Ordering::Acquire);
        if consumers > 0 {
            match self.allocator.lookup(buffer.id()) {
                Ok(slot) => {
                    let meta = self.allocator.registry().metadata().entry(slot);
                    for _ in 0..consumers {
                        meta.add_ref();
                    }
                }
                Err(e) => {
                    log::error!("[QUEUE] ref bump for buffer {} failed: {e}", buffer.id());
                }
            }
        }

        header.tail.store(tail + 1, Ordering::Release);
        global_metrics().inc_pushes();
        Ok(())
    }

    // ----- consumer side -----

    /// Non-blocking pop for one consumer; never suspends.
    ///
    /// The returned handle adopts the refcount unit the push took for
    /// this consumer.
    pub fn pop(&self, consumer: ConsumerId) -> Result<BufferHandle> {
        let id = self.pop_id(consumer)?;
        let handle = BufferHandle::adopt(id, Arc::clone(&self.allocator));
        if handle.is_valid() {
            Ok(handle)
        } else {
            // A peer released a buffer we held a unit for - a protocol
            // violation on their side, surfaced upward.
            Err(ShmError::BufferGone { buffer_id: id })
        }
    }

    /// Non-blocking pop returning the raw buffer id.
    pub fn pop_id(&self, consumer: ConsumerId) -> Result<BufferId> {
        let header = self.header();
        let c = consumer as usize;
        if c >= MAX_CONSUMERS_PER_QUEUE {
            return Err(ShmError::NotRegistered { consumer });
        }

        let _guard = header.mutex.lock();

        if !header.consumer_active[c].load(Ordering::Acquire) {
            return Err(ShmError::NotRegistered { consumer });
        }

        let head = header.consumer_heads[c].load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        if head >= tail {
            return if header.closed.load(Ordering::Acquire) {
                Err(ShmError::Closed)
            } else {
                Err(ShmError::QueueEmpty)
            };
        }

        let id = self.ring_entry(head).load(Ordering::Relaxed);
        header.consumer_heads[c].store(head + 1, Ordering::Release);

        // If we were the slowest consumer, a ring slot just became
        // reclaimable for the producer.
        if header.min_head() > head {
            header.not_full.notify_all();
        }

        global_metrics().inc_pops();
        Ok(id)
    }

    /// Pop with a deadline, polling at a fixed cadence.
    pub fn pop_with_timeout(
        &self,
        consumer: ConsumerId,
        timeout: Duration,
    ) -> Result<BufferHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.pop(consumer) {
                Err(ShmError::QueueEmpty) => {
                    if Instant::now() >= deadline {
                        return Err(ShmError::QueueEmpty);
                    }
                    std::thread::sleep(POP_POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }

    // ----- state -----

    /// Close the queue: waiters unwind with `Closed`, new pushes fail.
    /// Unread entries stay poppable so consumers can drain.
    pub fn close(&self) {
        let header = self.header();
        {
            // The flag must flip inside the mutex: a pusher between its
            // closed-check and its condvar snapshot would otherwise miss
            // the wake and sleep forever.
            let _guard = header.mutex.lock();
            header.closed.store(true, Ordering::Release);
        }
        header.not_full.notify_all();
        log::debug!("[QUEUE] closed {}", self.segment.name());
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire)
    }

    /// Entries a consumer has not read yet.
    pub fn size_for_consumer(&self, consumer: ConsumerId) -> Result<u64> {
        let header = self.header();
        let c = consumer as usize;
        if c >= MAX_CONSUMERS_PER_QUEUE || !header.consumer_active[c].load(Ordering::Acquire) {
            return Err(ShmError::NotRegistered { consumer });
        }
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.consumer_heads[c].load(Ordering::Acquire);
        Ok(tail - head)
    }

    /// Ring capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Number of active consumers.
    #[must_use]
    pub fn consumer_count(&self) -> u32 {
        self.header().consumer_count.load(Ordering::Acquire)
    }

    /// Port id recorded by the creator.
    #[must_use]
    pub fn port_id(&self) -> PortId {
        self.header().port_id
    }

    /// OS pid of the current producer owner (0 after a graceful drop).
    #[must_use]
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    /// Segment name backing this queue.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }
}

impl Drop for PortQueue {
    fn drop(&mut self) {
        if self.owned {
            // Graceful producer teardown: wake everybody, release the
            // ownership claim, remove the name. Peer mappings stay valid.
            self.close();
            self.header().owner_pid.store(0, Ordering::Release);
            let _ = ShmSegment::unlink(self.segment.name());
        }
    }
}

/// Inspect an existing queue segment and report its owner pid.
///
/// `None` means the segment is unusable (half-initialized, wrong
/// magic/version, or explicitly unclaimed) and may be discarded.
fn probe_owner(name: &str) -> Option<u32> {
    let segment = ShmSegment::open(name).ok()?;
    if segment.size() < ring_offset() {
        return None;
    }
    // SAFETY: size checked above; read-only header probe.
    let header = unsafe { &*(segment.as_ptr() as *const PortQueueHeader) };
    if wait_initialized_for(&header.initialized, name, PROBE_INIT_TIMEOUT).is_err() {
        return None;
    }
    if !header.validate() {
        return None;
    }
    match header.owner_pid.load(Ordering::Acquire) {
        0 => None,
        pid => Some(pid),
    }
}

/// Sweep `/dev/shm` for port-queue segments whose producer is dead and
/// unlink them. Returns the number of segments cleaned up.
///
/// Intended for process startup, mirroring the takeover logic in
/// [`PortQueue::create`] for queues nobody is about to re-create.
pub fn cleanup_stale_segments() -> usize {
    let mut cleaned = 0;

    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(PORT_NAME_PREFIX) {
            continue;
        }

        let stale = match probe_owner(name) {
            Some(pid) => !process_alive(pid),
            None => true,
        };
        if stale && ShmSegment::unlink(name).is_ok() {
            log::debug!("[QUEUE] cleaned up stale segment {name}");
            cleaned += 1;
        }
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ShmConfig};
    use crate::registry::Registry;
    use crate::ShmManager;

    fn unique(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{prefix}_{ts}")
    }

    struct Fixture {
        manager: ShmManager,
        reg_name: String,
        pool_shm: String,
    }

    impl Fixture {
        fn new() -> Self {
            let reg_name = unique("mqshm_test_q_reg");
            let pool = unique("q");
            let registry =
                Arc::new(Registry::init_or_attach_named(&reg_name).expect("registry"));
            let pid = registry.register_process("queue_test").unwrap();
            let manager = ShmManager::new(
                registry,
                pid,
                ShmConfig {
                    pools: vec![PoolConfig::new(&pool, 256, 16)],
                },
            )
            .expect("manager");
            let pool_shm = crate::config::pool_segment_name(&pool);
            Self {
                manager,
                reg_name,
                pool_shm,
            }
        }

        fn queue(&self, capacity: usize) -> PortQueue {
            let name = unique("mqshm_port_test");
            PortQueue::create(&name, 1, capacity, self.manager.allocator()).expect("queue")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            ShmSegment::unlink(&self.pool_shm).ok();
            Registry::remove(&self.reg_name).ok();
        }
    }

    #[test]
    fn test_header_ring_alignment() {
        assert_eq!(std::mem::align_of::<PortQueueHeader>(), 64);
        assert_eq!(ring_offset() % 8, 0);
    }

    #[test]
    fn test_create_open_validate() {
        let fx = Fixture::new();
        let queue = fx.queue(8);
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.port_id(), 1);
        assert_eq!(queue.consumer_count(), 0);
        assert_eq!(queue.owner_pid(), current_pid());

        let view = PortQueue::open(queue.segment_name(), fx.manager.allocator()).expect("open");
        assert_eq!(view.capacity(), 8);
        assert_eq!(view.port_id(), 1);
    }

    #[test]
    fn test_producer_already_live() {
        let fx = Fixture::new();
        let queue = fx.queue(8);

        let err = PortQueue::create(queue.segment_name(), 1, 8, fx.manager.allocator());
        assert!(matches!(err, Err(ShmError::ProducerAlreadyLive { .. })));
    }

    #[test]
    fn test_stale_producer_takeover() {
        let fx = Fixture::new();
        let queue = fx.queue(8);
        let name = queue.segment_name().to_string();

        // Fake a crashed producer: rewrite the claim to a dead pid and
        // leak the queue so Drop does not unlink the segment.
        queue
            .header()
            .owner_pid
            .store(0x3FFF_FFF0, Ordering::Release);
        std::mem::forget(queue);

        // A second producer observes the dead owner, reclaims the name
        // and re-creates the queue under its own pid.
        let fresh =
            PortQueue::create(&name, 2, 8, fx.manager.allocator()).expect("takeover succeeds");
        assert_eq!(fresh.owner_pid(), current_pid());
        assert_eq!(fresh.port_id(), 2);
    }

    #[test]
    fn test_spsc_roundtrip() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let c0 = queue.register_consumer().expect("consumer");

        let mut buf = fx.manager.allocate(64).expect("allocate");
        buf.data_mut()[..4].copy_from_slice(&[0, 1, 2, 3]);
        let id = buf.id();

        queue.push(&buf).expect("push");
        assert_eq!(queue.size_for_consumer(c0).unwrap(), 1);
        drop(buf);

        let received = queue.pop(c0).expect("pop");
        assert_eq!(received.id(), id);
        assert_eq!(&received.data()[..4], &[0, 1, 2, 3]);
        assert_eq!(queue.size_for_consumer(c0).unwrap(), 0);
        drop(received);

        // Everything returned: pool full again, metadata empty
        assert_eq!(fx.manager.stats().pool_stats[0].blocks_free, 16);
        assert_eq!(fx.manager.registry().metadata().allocated_count(), 0);
    }

    #[test]
    fn test_broadcast_two_consumers() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let c0 = queue.register_consumer().unwrap();
        let c1 = queue.register_consumer().unwrap();
        assert_ne!(c0, c1);
        assert_eq!(queue.consumer_count(), 2);

        let allocator = fx.manager.allocator();
        let id;
        {
            let mut buf = fx.manager.allocate(8).expect("allocate");
            buf.data_mut()[0] = 0x42;
            id = buf.id();
            queue.push(&buf).expect("push");
            // Producer unit + one per consumer
            assert_eq!(buf.refcount(), 3);
        }
        // Producer handle dropped: exactly the two consumer units remain
        assert_eq!(
            allocator.registry().metadata().entry(
                allocator.registry().metadata().find_slot_by_id(id).unwrap()
            ).refcount(),
            2
        );

        assert_eq!(queue.size_for_consumer(c0).unwrap(), 1);
        assert_eq!(queue.size_for_consumer(c1).unwrap(), 1);

        let b0 = queue.pop(c0).expect("pop c0");
        assert_eq!(b0.data()[0], 0x42);
        drop(b0);
        // c1's unit still pins the buffer
        assert!(allocator.registry().metadata().find_slot_by_id(id).is_some());

        let b1 = queue.pop(c1).expect("pop c1");
        assert_eq!(b1.id(), id);
        drop(b1);

        // Last unit dropped: buffer fully released
        assert!(allocator.registry().metadata().find_slot_by_id(id).is_none());
        assert_eq!(fx.manager.registry().metadata().allocated_count(), 0);
    }

    #[test]
    fn test_late_subscriber_sees_only_future() {
        let fx = Fixture::new();
        let queue = fx.queue(4);

        let b1 = fx.manager.allocate(8).expect("b1");
        queue.push(&b1).expect("push b1");

        let c0 = queue.register_consumer().unwrap();
        assert_eq!(queue.size_for_consumer(c0).unwrap(), 0);

        let b2 = fx.manager.allocate(8).expect("b2");
        queue.push(&b2).expect("push b2");

        let got = queue.pop(c0).expect("pop");
        assert_eq!(got.id(), b2.id());
        assert!(matches!(queue.pop(c0), Err(ShmError::QueueEmpty)));
    }

    #[test]
    fn test_zero_consumer_push_accepted() {
        let fx = Fixture::new();
        let queue = fx.queue(2);

        let buf = fx.manager.allocate(8).expect("allocate");
        let id = buf.id();
        // No consumers: accepted, no ref bump
        queue.push(&buf).expect("push");
        assert_eq!(buf.refcount(), 1);

        // Producer's drop is the only unit; the buffer returns to the pool
        drop(buf);
        assert!(fx
            .manager
            .registry()
            .metadata()
            .find_slot_by_id(id)
            .is_none());

        // More pushes than capacity never block with no consumers
        for _ in 0..5 {
            let b = fx.manager.allocate(8).expect("allocate");
            queue.push(&b).expect("push");
        }
    }

    #[test]
    fn test_slow_consumer_backpressure() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.queue(2));
        let c0 = queue.register_consumer().unwrap();
        let c1 = queue.register_consumer().unwrap();

        let b1 = fx.manager.allocate(8).expect("b1");
        let b2 = fx.manager.allocate(8).expect("b2");
        let b3 = fx.manager.allocate(8).expect("b3");
        queue.push(&b1).expect("push b1");
        queue.push(&b2).expect("push b2");

        // Ring is full for both consumers: timed push expires
        assert!(matches!(
            queue.push_with_timeout(&b3, Duration::from_millis(50)),
            Err(ShmError::QueueFull)
        ));

        // Fast consumer drains completely; slow consumer still pins the ring
        queue.pop(c0).expect("c0 b1");
        queue.pop(c0).expect("c0 b2");
        assert!(matches!(
            queue.push_with_timeout(&b3, Duration::from_millis(50)),
            Err(ShmError::QueueFull)
        ));

        // Unblock by advancing the slow consumer from another thread
        // while a blocking push is parked.
        let q = Arc::clone(&queue);
        let popper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            q.pop(c1).expect("c1 b1")
        });

        queue.push(&b3).expect("push b3 after slowest advanced");
        let got = popper.join().expect("popper");
        assert_eq!(got.id(), b1.id());

        // Slow consumer still owes b2 and b3
        assert_eq!(queue.size_for_consumer(c1).unwrap(), 2);
        assert_eq!(queue.pop(c1).unwrap().id(), b2.id());
        assert_eq!(queue.pop(c1).unwrap().id(), b3.id());
        assert_eq!(queue.size_for_consumer(c0).unwrap(), 1);
        assert_eq!(queue.pop(c0).unwrap().id(), b3.id());
    }

    #[test]
    fn test_unregister_refunds_unread() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let c0 = queue.register_consumer().unwrap();
        let c1 = queue.register_consumer().unwrap();

        let mut bufs = Vec::new();
        for _ in 0..4 {
            let b = fx.manager.allocate(8).expect("allocate");
            queue.push(&b).expect("push");
            bufs.push(b);
        }
        // Each buffer: producer handle + 2 consumer units
        for b in &bufs {
            assert_eq!(b.refcount(), 3);
        }

        // Unregister c1 with its head still at 0: one unit per buffer
        // comes back
        queue.unregister_consumer(c1).expect("unregister");
        for b in &bufs {
            assert_eq!(b.refcount(), 2);
        }
        assert_eq!(queue.consumer_count(), 1);

        // c0 is now the only backpressure source; a push fits after one pop
        queue.pop(c0).expect("pop");
        let extra = fx.manager.allocate(8).expect("extra");
        queue
            .push_with_timeout(&extra, Duration::from_millis(100))
            .expect("push fits");

        assert!(matches!(
            queue.unregister_consumer(c1),
            Err(ShmError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_close_unwinds_blocked_push() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.queue(1));
        let _c0 = queue.register_consumer().unwrap();

        let b1 = fx.manager.allocate(8).expect("b1");
        queue.push(&b1).expect("push");

        let q = Arc::clone(&queue);
        let b2 = fx.manager.allocate(8).expect("b2");
        let pusher = std::thread::spawn(move || q.push(&b2));

        std::thread::sleep(Duration::from_millis(50));
        queue.close();

        let result = pusher.join().expect("pusher");
        assert!(matches!(result, Err(ShmError::Closed)));
        assert!(queue.is_closed());

        // Push on a closed queue fails immediately
        let b3 = fx.manager.allocate(8).expect("b3");
        assert!(matches!(queue.push(&b3), Err(ShmError::Closed)));
    }

    #[test]
    fn test_pop_with_timeout() {
        let fx = Fixture::new();
        let queue = Arc::new(fx.queue(4));
        let c0 = queue.register_consumer().unwrap();

        // Empty queue: timed pop expires
        let start = Instant::now();
        assert!(matches!(
            queue.pop_with_timeout(c0, Duration::from_millis(30)),
            Err(ShmError::QueueEmpty)
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));

        // A push from another thread wakes the poller
        let q = Arc::clone(&queue);
        let allocator_mgr = &fx.manager;
        let buf = allocator_mgr.allocate(8).expect("allocate");
        let id = buf.id();
        let pusher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            q.push(&buf).expect("push");
        });

        let got = queue
            .pop_with_timeout(c0, Duration::from_secs(2))
            .expect("timed pop");
        assert_eq!(got.id(), id);
        pusher.join().expect("pusher");
    }

    #[test]
    fn test_consumer_slot_exhaustion_and_reuse() {
        let fx = Fixture::new();
        let queue = fx.queue(4);

        let mut ids = Vec::new();
        for _ in 0..MAX_CONSUMERS_PER_QUEUE {
            ids.push(queue.register_consumer().expect("slot"));
        }
        assert!(matches!(
            queue.register_consumer(),
            Err(ShmError::OutOfSlots)
        ));

        queue.unregister_consumer(ids[0]).expect("unregister");
        let again = queue.register_consumer().expect("slot recycled");
        assert_eq!(again, ids[0]);
    }

    #[test]
    fn test_reap_dead_consumers() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let c0 = queue.register_consumer().unwrap();
        let c1 = queue.register_consumer().unwrap();

        let buf = fx.manager.allocate(8).expect("allocate");
        queue.push(&buf).expect("push");
        assert_eq!(buf.refcount(), 3);

        // Fake c1 belonging to a dead process
        queue.header().consumer_pids[c1 as usize].store(0x3FFF_FFF0, Ordering::Relaxed);

        assert_eq!(queue.reap_dead_consumers(), 1);
        assert_eq!(queue.consumer_count(), 1);
        assert_eq!(buf.refcount(), 2);

        // The live consumer is untouched
        assert_eq!(queue.size_for_consumer(c0).unwrap(), 1);
        assert_eq!(queue.reap_dead_consumers(), 0);
    }

    #[test]
    fn test_cleanup_stale_segments() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let name = queue.segment_name().to_string();

        // Orphan the segment under a dead owner pid
        queue
            .header()
            .owner_pid
            .store(0x3FFF_FFF1, Ordering::Release);
        std::mem::forget(queue);
        assert!(ShmSegment::exists(&name));

        let cleaned = cleanup_stale_segments();
        assert!(cleaned >= 1);
        assert!(!ShmSegment::exists(&name));
    }

    #[test]
    fn test_drop_unlinks_owned_segment() {
        let fx = Fixture::new();
        let queue = fx.queue(4);
        let name = queue.segment_name().to_string();
        assert!(ShmSegment::exists(&name));
        drop(queue);
        assert!(!ShmSegment::exists(&name));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process buffer allocation facade.
//!
//! [`BufferAllocator`] is the process-local engine: it resolves pool ids
//! to lazily-mapped pool views, allocates pool blocks plus metadata
//! slots, and carries the refcount plumbing that [`crate::BufferHandle`]
//! and [`crate::PortQueue`] rely on.
//!
//! [`ShmManager`] sits on top: it creates (or adopts) the configured
//! pools, picks the smallest pool that fits an allocation request, and
//! aggregates utilization statistics.
//!
//! # Pool selection
//!
//! Linear scan of the registry's pool descriptors for the minimum
//! `block_size >= request`. Descriptors are published under the registry
//! mutex before any process can see them, so lazy mapping on first touch
//! is always safe (`BufferPool::open` is idempotent per process).

use crate::config::{pool_segment_name, PoolConfig, ShmConfig, POOL_NAME_PREFIX};
use crate::error::{Result, ShmError};
use crate::handle::BufferHandle;
use crate::metrics::global_metrics;
use crate::pool::BufferPool;
use crate::registry::Registry;
use crate::segment::ShmSegment;
use crate::{BufferId, PoolId, ProcessId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-local allocation engine shared by handles and queues.
pub struct BufferAllocator {
    registry: Arc<Registry>,
    process_id: ProcessId,
    /// Lazily populated pool views, keyed by pool id
    pools: Mutex<HashMap<PoolId, BufferPool>>,
    allocation_count: AtomicU64,
    deallocation_count: AtomicU64,
}

impl BufferAllocator {
    /// New allocator bound to a registry and a registered process id.
    #[must_use]
    pub fn new(registry: Arc<Registry>, process_id: ProcessId) -> Self {
        Self {
            registry,
            process_id,
            pools: Mutex::new(HashMap::new()),
            allocation_count: AtomicU64::new(0),
            deallocation_count: AtomicU64::new(0),
        }
    }

    /// The registry this allocator works against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dense process id recorded as buffer creator.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Adopt an already-open pool view (used by the manager for pools it
    /// just created).
    pub fn insert_pool(&self, pool: BufferPool) {
        self.pools.lock().insert(pool.pool_id(), pool);
    }

    /// Run `f` against the pool view, mapping it first if this process
    /// has not touched the pool yet.
    fn with_pool<R>(&self, pool_id: PoolId, f: impl FnOnce(&BufferPool) -> R) -> Result<R> {
        let mut pools = self.pools.lock();
        if !pools.contains_key(&pool_id) {
            let desc = self
                .registry
                .pool_descriptor(pool_id)
                .ok_or_else(|| ShmError::SegmentMissing(format!("pool descriptor {pool_id}")))?;
            let pool = BufferPool::open(&desc.shm_name)?;
            log::debug!(
                "[POOL] lazily mapped pool {pool_id} ({})",
                desc.shm_name
            );
            pools.insert(pool_id, pool);
        }
        Ok(f(&pools[&pool_id]))
    }

    /// Smallest active pool whose block size fits `size`.
    fn select_pool(&self, size: usize) -> Result<PoolId> {
        let mut best: Option<(PoolId, u64)> = None;
        for desc in self.registry.pool_descriptors() {
            if !desc.active || desc.block_size < size as u64 {
                continue;
            }
            if best.map_or(true, |(_, bs)| desc.block_size < bs) {
                best = Some((desc.pool_id, desc.block_size));
            }
        }
        best.map(|(id, _)| id)
            .ok_or(ShmError::NoPoolFits { requested: size })
    }

    /// Allocate a buffer of `size` bytes from the best-fitting pool.
    ///
    /// Returns the buffer id plus its metadata slot; the slot is
    /// published (live, refcount=1) before this returns.
    pub(crate) fn allocate(&self, size: usize) -> Result<(BufferId, u32)> {
        let pool_id = self.select_pool(size)?;
        self.allocate_in(pool_id, size)
    }

    /// Allocate from an explicit pool. `size` 0 means "the whole block".
    pub(crate) fn allocate_in(&self, pool_id: PoolId, size: usize) -> Result<(BufferId, u32)> {
        let (block_index, offset, block_size) = self.with_pool(pool_id, |pool| {
            pool.allocate_block()
                .map(|idx| (idx, pool.block_offset(idx).unwrap_or(0), pool.block_size()))
        })?
        .ok_or_else(|| {
            global_metrics().inc_alloc_failures();
            ShmError::OutOfBlocks { pool_id }
        })?;

        let stored_size = if size == 0 { block_size } else { size };

        let table = self.registry.metadata();
        let Some((slot, buffer_id)) = table.allocate_slot() else {
            // Give the block back before reporting exhaustion
            self.with_pool(pool_id, |pool| pool.free_block(block_index))?;
            global_metrics().inc_alloc_failures();
            return Err(ShmError::OutOfSlots);
        };

        table
            .entry(slot)
            .publish(pool_id, block_index, stored_size as u64, offset, self.process_id);

        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        global_metrics().inc_allocated();

        Ok((buffer_id, slot))
    }

    /// Find the metadata slot for a buffer id.
    pub(crate) fn lookup(&self, buffer_id: BufferId) -> Result<u32> {
        self.registry
            .metadata()
            .find_slot_by_id(buffer_id)
            .ok_or(ShmError::BufferGone { buffer_id })
    }

    /// Bump the refcount of a live buffer. Returns the new count.
    pub fn add_ref(&self, buffer_id: BufferId) -> Result<u32> {
        let slot = self.lookup(buffer_id)?;
        Ok(self.registry.metadata().entry(slot).add_ref())
    }

    /// Drop one refcount unit. The caller that observes the transition to
    /// zero releases the buffer; the returned count is post-decrement.
    pub fn remove_ref(&self, buffer_id: BufferId) -> Result<u32> {
        let slot = self.lookup(buffer_id)?;
        let meta = self.registry.metadata().entry(slot);
        let new_count = meta.remove_ref();
        if new_count == 0 {
            // We just observed live -> draining; release() performs the
            // draining -> free half of the slot state machine.
            self.release(buffer_id, slot);
        }
        Ok(new_count)
    }

    /// Release a drained buffer: invalidate the slot, return it to the
    /// table, then return the block to its pool. Infallible by contract -
    /// anomalies are logged and abandoned, never panicked.
    fn release(&self, buffer_id: BufferId, slot: u32) {
        let table = self.registry.metadata();
        let meta = table.entry(slot);
        if meta.buffer_id() != buffer_id {
            log::error!("[ALLOC] release raced: slot {slot} no longer holds buffer {buffer_id}");
            return;
        }
        if meta.refcount() != 0 {
            log::error!(
                "[ALLOC] release of buffer {buffer_id} with refcount {}",
                meta.refcount()
            );
            return;
        }

        let pool_id = meta.pool_id();
        let block_index = meta.block_index();

        meta.set_valid(false);
        table.free_slot(slot);

        if let Err(e) = self.with_pool(pool_id, |pool| pool.free_block(block_index)) {
            log::error!("[ALLOC] could not return block {block_index} to pool {pool_id}: {e}");
        }

        self.deallocation_count.fetch_add(1, Ordering::Relaxed);
        global_metrics().inc_released();
    }

    /// Process-local pointer to a buffer's data block.
    pub(crate) fn data_ptr(&self, slot: u32, buffer_id: BufferId) -> Result<*mut u8> {
        let meta = self.registry.metadata().entry(slot);
        if meta.buffer_id() != buffer_id || !meta.is_valid() {
            return Err(ShmError::BufferGone { buffer_id });
        }
        let block_index = meta.block_index();
        self.with_pool(meta.pool_id(), |pool| pool.block_ptr(block_index))?
            .ok_or(ShmError::BufferGone { buffer_id })
    }

    /// Allocations performed through this allocator.
    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Releases performed through this allocator.
    #[must_use]
    pub fn deallocation_count(&self) -> u64 {
        self.deallocation_count.load(Ordering::Relaxed)
    }
}

/// Utilization of one pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub pool_id: PoolId,
    pub block_size: usize,
    pub block_count: usize,
    pub blocks_used: usize,
    pub blocks_free: usize,
    /// `blocks_used / block_count`, 0.0 for empty pools
    pub utilization: f64,
}

/// Aggregated allocator statistics.
#[derive(Debug, Clone, Default)]
pub struct ShmStats {
    pub total_pools: usize,
    pub total_capacity: usize,
    pub total_allocated: usize,
    pub total_free: usize,
    pub allocation_count: u64,
    pub deallocation_count: u64,
    pub pool_stats: Vec<PoolStats>,
}

/// Per-process facade over pools, allocation, and statistics.
pub struct ShmManager {
    allocator: Arc<BufferAllocator>,
    /// Pool name -> pool id for pools this manager created or adopted
    pool_names: Mutex<HashMap<String, PoolId>>,
}

impl ShmManager {
    /// Create a manager, establishing (or adopting) every configured
    /// pool.
    ///
    /// When a configured pool already exists - a peer process created it
    /// first - the existing segment is adopted instead of failing, so any
    /// number of processes can start with the same [`ShmConfig`].
    pub fn new(registry: Arc<Registry>, process_id: ProcessId, config: ShmConfig) -> Result<Self> {
        let manager = Self {
            allocator: Arc::new(BufferAllocator::new(registry, process_id)),
            pool_names: Mutex::new(HashMap::new()),
        };

        for pool_config in &config.pools {
            manager.ensure_pool(pool_config)?;
        }

        Ok(manager)
    }

    /// The allocator shared with handles and queues.
    #[must_use]
    pub fn allocator(&self) -> Arc<BufferAllocator> {
        Arc::clone(&self.allocator)
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        self.allocator.registry()
    }

    /// Create the pool if it is not registered yet, otherwise adopt the
    /// existing descriptor.
    fn ensure_pool(&self, config: &PoolConfig) -> Result<PoolId> {
        let shm_name = pool_segment_name(&config.name);

        let existing = self
            .registry()
            .pool_descriptors()
            .into_iter()
            .find(|d| d.active && d.shm_name == shm_name);

        if let Some(desc) = existing {
            self.pool_names
                .lock()
                .insert(config.name.clone(), desc.pool_id);
            return Ok(desc.pool_id);
        }

        self.add_pool(&config.name, config.block_size, config.block_count)
    }

    /// Create a new pool segment and record its descriptor.
    pub fn add_pool(&self, name: &str, block_size: usize, block_count: usize) -> Result<PoolId> {
        let shm_name = pool_segment_name(name);
        if self.pool_names.lock().contains_key(name) {
            return Err(ShmError::SegmentExists(shm_name));
        }

        // Descriptor first: the registry hands out the dense pool id the
        // segment header must carry.
        let pool_id =
            self.registry()
                .register_pool(block_size as u64, block_count as u64, &shm_name)?;

        let pool = match BufferPool::create(&shm_name, pool_id, block_size, block_count) {
            Ok(pool) => pool,
            Err(e) => {
                self.registry().unregister_pool(pool_id);
                return Err(e);
            }
        };

        self.allocator.insert_pool(pool);
        self.pool_names.lock().insert(name.to_string(), pool_id);

        log::info!("[POOL] added pool '{name}' (id {pool_id}, {block_size} x {block_count})");
        Ok(pool_id)
    }

    /// Tombstone a pool. With `unlink_segment` the backing segment name
    /// is also removed; live mappings in other processes stay valid
    /// either way.
    pub fn remove_pool(&self, name: &str, unlink_segment: bool) {
        let Some(pool_id) = self.pool_names.lock().remove(name) else {
            return;
        };
        self.registry().unregister_pool(pool_id);
        if unlink_segment {
            ShmSegment::unlink(&pool_segment_name(name)).ok();
        }
        log::info!("[POOL] removed pool '{name}' (id {pool_id})");
    }

    /// Allocate a buffer of `size` bytes from the smallest fitting pool.
    pub fn allocate(&self, size: usize) -> Result<BufferHandle> {
        let (buffer_id, slot) = self.allocator.allocate(size)?;
        Ok(BufferHandle::claim(buffer_id, slot, self.allocator()))
    }

    /// Allocate a whole block from a pool chosen by name.
    pub fn allocate_from_pool(&self, name: &str) -> Result<BufferHandle> {
        let pool_id = self.resolve_pool(name)?;
        let (buffer_id, slot) = self.allocator.allocate_in(pool_id, 0)?;
        Ok(BufferHandle::claim(buffer_id, slot, self.allocator()))
    }

    fn resolve_pool(&self, name: &str) -> Result<PoolId> {
        if let Some(&id) = self.pool_names.lock().get(name) {
            return Ok(id);
        }
        // A peer may have registered the pool; resolve through the
        // registry by segment name.
        let shm_name = pool_segment_name(name);
        self.registry()
            .pool_descriptors()
            .into_iter()
            .find(|d| d.active && d.shm_name == shm_name)
            .map(|d| d.pool_id)
            .ok_or(ShmError::SegmentMissing(shm_name))
    }

    /// Names of the pools this manager created or adopted.
    #[must_use]
    pub fn list_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pool_names.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Aggregate utilization over every active pool in the registry.
    pub fn stats(&self) -> ShmStats {
        let mut stats = ShmStats {
            allocation_count: self.allocator.allocation_count(),
            deallocation_count: self.allocator.deallocation_count(),
            ..ShmStats::default()
        };

        for desc in self.registry().pool_descriptors() {
            if !desc.active {
                continue;
            }
            let Ok((free, block_size, block_count)) = self.allocator.with_pool(desc.pool_id, |p| {
                (p.free_count() as usize, p.block_size(), p.block_count())
            }) else {
                continue;
            };

            let used = block_count - free;
            let name = desc
                .shm_name
                .strip_prefix(POOL_NAME_PREFIX)
                .unwrap_or(&desc.shm_name)
                .to_string();

            stats.total_pools += 1;
            stats.total_capacity += block_size * block_count;
            stats.total_allocated += block_size * used;
            stats.total_free += block_size * free;
            stats.pool_stats.push(PoolStats {
                name,
                pool_id: desc.pool_id,
                block_size,
                block_count,
                blocks_used: used,
                blocks_free: free,
                utilization: if block_count > 0 {
                    used as f64 / block_count as f64
                } else {
                    0.0
                },
            });
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn unique(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{prefix}_{ts}")
    }

    fn test_manager(pools: Vec<PoolConfig>) -> (ShmManager, String, Vec<String>) {
        let reg_name = unique("mqshm_test_mgr_reg");
        let registry = Arc::new(Registry::init_or_attach_named(&reg_name).expect("registry"));
        let process_id = registry.register_process("test").expect("process");
        let pool_names: Vec<String> = pools.iter().map(|p| pool_segment_name(&p.name)).collect();
        let manager =
            ShmManager::new(registry, process_id, ShmConfig { pools }).expect("manager");
        (manager, reg_name, pool_names)
    }

    fn cleanup(reg_name: &str, pool_names: &[String]) {
        for name in pool_names {
            ShmSegment::unlink(name).ok();
        }
        Registry::remove(reg_name).ok();
    }

    #[test]
    fn test_smallest_fit_selection() {
        let (manager, reg, pools) = test_manager(vec![
            PoolConfig::new(&unique("tiny"), 64, 4),
            PoolConfig::new(&unique("mid"), 1024, 4),
            PoolConfig::new(&unique("big"), 65536, 2),
        ]);

        // 100 bytes skips the 64-byte pool, lands in the 1 KiB pool
        let buf = manager.allocate(100).expect("allocate");
        assert_eq!(buf.size(), 100);
        let stats = manager.stats();
        let mid = stats
            .pool_stats
            .iter()
            .find(|p| p.block_size == 1024)
            .unwrap();
        assert_eq!(mid.blocks_used, 1);

        drop(buf);
        cleanup(&reg, &pools);
    }

    #[test]
    fn test_no_pool_fits() {
        let (manager, reg, pools) = test_manager(vec![PoolConfig::new(&unique("small"), 64, 4)]);
        assert!(matches!(
            manager.allocate(65),
            Err(ShmError::NoPoolFits { requested: 65 })
        ));
        cleanup(&reg, &pools);
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() {
        let (manager, reg, pools) = test_manager(vec![PoolConfig::new(&unique("p"), 64, 2)]);

        let a = manager.allocate(10).expect("a");
        let _b = manager.allocate(10).expect("b");
        assert!(matches!(
            manager.allocate(10),
            Err(ShmError::OutOfBlocks { .. })
        ));

        drop(a);
        let _c = manager.allocate(10).expect("block came back");

        cleanup(&reg, &pools);
    }

    #[test]
    fn test_allocate_from_pool_uses_whole_block() {
        let name = unique("named");
        let (manager, reg, pools) = test_manager(vec![PoolConfig::new(&name, 256, 2)]);

        let buf = manager.allocate_from_pool(&name).expect("allocate");
        assert_eq!(buf.size(), 256);

        assert!(matches!(
            manager.allocate_from_pool("no_such_pool"),
            Err(ShmError::SegmentMissing(_))
        ));

        drop(buf);
        cleanup(&reg, &pools);
    }

    #[test]
    fn test_add_remove_pool() {
        let (manager, reg, mut pools) = test_manager(vec![]);
        let name = unique("dyn");

        let pool_id = manager.add_pool(&name, 128, 4).expect("add");
        pools.push(pool_segment_name(&name));
        assert_eq!(manager.list_pools(), vec![name.clone()]);

        // Duplicate add is refused
        assert!(matches!(
            manager.add_pool(&name, 128, 4),
            Err(ShmError::SegmentExists(_))
        ));

        manager.remove_pool(&name, false);
        assert!(manager.list_pools().is_empty());
        // Tombstoned: descriptor remains, inactive
        let desc = manager.registry().pool_descriptor(pool_id).unwrap();
        assert!(!desc.active);

        cleanup(&reg, &pools);
    }

    #[test]
    fn test_stats_roundtrip() {
        let (manager, reg, pools) = test_manager(vec![PoolConfig::new(&unique("s"), 64, 4)]);

        let before = manager.stats();
        assert_eq!(before.total_pools, 1);
        assert_eq!(before.total_allocated, 0);

        let buf = manager.allocate(32).expect("allocate");
        let during = manager.stats();
        assert_eq!(during.pool_stats[0].blocks_used, 1);
        assert_eq!(during.pool_stats[0].blocks_free, 3);
        assert!((during.pool_stats[0].utilization - 0.25).abs() < 1e-9);
        assert_eq!(during.allocation_count, 1);

        drop(buf);
        let after = manager.stats();
        assert_eq!(after.total_allocated, 0);
        assert_eq!(after.deallocation_count, 1);

        cleanup(&reg, &pools);
    }

    #[test]
    fn test_two_managers_share_pools() {
        let reg_name = unique("mqshm_test_mgr2_reg");
        let pool_name = unique("shared");
        let registry = Arc::new(Registry::init_or_attach_named(&reg_name).expect("registry"));
        let p1 = registry.register_process("one").unwrap();
        let p2 = registry.register_process("two").unwrap();

        let config = ShmConfig {
            pools: vec![PoolConfig::new(&pool_name, 64, 4)],
        };
        let m1 = ShmManager::new(Arc::clone(&registry), p1, config.clone()).expect("m1");
        // Second manager adopts the existing pool instead of failing
        let m2 = ShmManager::new(Arc::clone(&registry), p2, config).expect("m2");

        let buf = m1.allocate(16).expect("allocate");
        // Allocation from m1 is visible in m2's stats
        assert_eq!(m2.stats().pool_stats[0].blocks_used, 1);

        drop(buf);
        ShmSegment::unlink(&pool_segment_name(&pool_name)).ok();
        Registry::remove(&reg_name).ok();
    }
}

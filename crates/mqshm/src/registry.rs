// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global registry: the root shared-memory structure.
//!
//! One segment (`mqshm_global_registry`) holds every table the runtime
//! needs to name and enumerate things: processes, blocks, connections,
//! pool descriptors, and the buffer metadata table. Each sub-registry has
//! its own cross-process mutex; none of them nest.
//!
//! # Initialization protocol
//!
//! The very first process to attach creates the segment and initializes
//! every table, then publishes the root `initialized` flag with release
//! ordering. Later processes open the segment, spin on the flag, and
//! validate magic and version. The registry outlives individual
//! processes; nothing tears it down implicitly (explicit
//! [`Registry::remove`] only).

use crate::config::{
    DEAD_PROCESS_TIMEOUT, GLOBAL_REGISTRY_NAME, MAX_BLOCKS, MAX_BUFFER_POOLS, MAX_CONNECTIONS,
    MAX_PROCESSES, SHM_MAGIC, SHM_VERSION,
};
use crate::error::{Result, ShmError};
use crate::metadata::MetadataTable;
use crate::pool::PoolHeader;
use crate::process::current_pid;
use crate::segment::{wait_initialized, ShmSegment};
use crate::sync::ShmMutex;
use crate::timestamp::Timestamp;
use crate::{BlockId, ConnectionId, PoolId, ProcessId, INVALID_POOL_ID};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

// ===== fixed-size name fields =====

const NAME_LEN: usize = 64;

/// Copy `s` into a fixed name field, truncating at 63 bytes.
///
/// # Safety
///
/// The caller must hold the mutex of the sub-registry that owns `cell`.
unsafe fn write_name(cell: &UnsafeCell<[u8; NAME_LEN]>, s: &str) {
    let buf = &mut *cell.get();
    buf.fill(0);
    let n = s.len().min(NAME_LEN - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Read a NUL-terminated name field.
///
/// # Safety
///
/// The caller must hold the mutex of the sub-registry that owns `cell`.
unsafe fn read_name(cell: &UnsafeCell<[u8; NAME_LEN]>) -> String {
    let buf = &*cell.get();
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

// ===== process registry =====

/// Registered process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    /// Registered, not yet running
    Starting = 0,
    /// Heartbeating normally
    Running = 1,
    /// Graceful shutdown in progress
    Stopping = 2,
    /// Unregistered
    Stopped = 3,
    /// Declared dead by liveness check
    Dead = 4,
}

impl ProcessState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            4 => Self::Dead,
            _ => Self::Stopped,
        }
    }
}

/// One process table entry.
#[repr(C)]
pub struct ProcessInfo {
    /// Dense process id (slot + 1); 0 marks a free entry
    process_id: AtomicU32,
    state: AtomicU8,
    _pad: [u8; 3],
    /// OS pid, for debugging and liveness cross-checks
    native_pid: AtomicU32,
    last_heartbeat_ns: AtomicU64,
    start_time_ns: AtomicU64,
    name: UnsafeCell<[u8; NAME_LEN]>,
}

/// Copy-out view of a process entry.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub process_id: ProcessId,
    pub state: ProcessState,
    pub native_pid: u32,
    pub last_heartbeat_ns: u64,
    pub start_time_ns: u64,
    pub name: String,
}

#[repr(C)]
struct ProcessRegistry {
    mutex: ShmMutex,
    process_count: AtomicU32,
    processes: [ProcessInfo; MAX_PROCESSES],
}

impl ProcessRegistry {
    fn initialize(&self) {
        for p in &self.processes {
            p.process_id.store(0, Ordering::Relaxed);
            p.state.store(ProcessState::Stopped as u8, Ordering::Relaxed);
        }
        self.process_count.store(0, Ordering::Relaxed);
    }

    fn register(&self, name: &str) -> Option<ProcessId> {
        let _guard = self.mutex.lock();
        for (i, p) in self.processes.iter().enumerate() {
            if p.process_id.load(Ordering::Relaxed) == 0 {
                let id = (i + 1) as ProcessId;
                let now = Timestamp::now().to_nanos();
                p.state.store(ProcessState::Starting as u8, Ordering::Relaxed);
                p.native_pid.store(current_pid(), Ordering::Relaxed);
                p.start_time_ns.store(now, Ordering::Relaxed);
                p.last_heartbeat_ns.store(now, Ordering::Relaxed);
                // SAFETY: the process mutex is held.
                unsafe { write_name(&p.name, name) };
                p.process_id.store(id, Ordering::Release);
                self.process_count.fetch_add(1, Ordering::Relaxed);
                return Some(id);
            }
        }
        None
    }

    fn entry(&self, id: ProcessId) -> Option<&ProcessInfo> {
        let slot = (id as usize).checked_sub(1)?;
        let p = self.processes.get(slot)?;
        if p.process_id.load(Ordering::Acquire) == id {
            Some(p)
        } else {
            None
        }
    }

    fn unregister(&self, id: ProcessId) {
        let _guard = self.mutex.lock();
        if let Some(p) = self.entry(id) {
            p.state.store(ProcessState::Stopped as u8, Ordering::Relaxed);
            p.process_id.store(0, Ordering::Release);
            self.process_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

// ===== block registry =====

/// Role of a block in the dataflow graph. Informational for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    /// Only output ports
    Source = 0,
    /// Input and output ports
    Processing = 1,
    /// Only input ports
    Sink = 2,
}

impl BlockType {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Source,
            2 => Self::Sink,
            _ => Self::Processing,
        }
    }
}

#[repr(C)]
struct BlockInfo {
    /// Block id; 0 marks a free entry
    block_id: AtomicU32,
    block_type: AtomicU8,
    _pad: [u8; 3],
    owner_process: AtomicU32,
    create_time_ns: AtomicU64,
    name: UnsafeCell<[u8; NAME_LEN]>,
}

/// Copy-out view of a block entry.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub block_id: BlockId,
    pub block_type: BlockType,
    pub owner_process: ProcessId,
    pub create_time_ns: u64,
    pub name: String,
}

#[repr(C)]
struct BlockRegistry {
    mutex: ShmMutex,
    block_count: AtomicU32,
    next_block_id: AtomicU32,
    _pad: u32,
    blocks: [BlockInfo; MAX_BLOCKS],
}

impl BlockRegistry {
    fn initialize(&self) {
        for b in &self.blocks {
            b.block_id.store(0, Ordering::Relaxed);
        }
        self.block_count.store(0, Ordering::Relaxed);
        self.next_block_id.store(1, Ordering::Relaxed);
    }

    fn register(&self, name: &str, block_type: BlockType, owner: ProcessId) -> Option<BlockId> {
        let _guard = self.mutex.lock();
        for b in &self.blocks {
            if b.block_id.load(Ordering::Relaxed) == 0 {
                let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
                b.block_type.store(block_type as u8, Ordering::Relaxed);
                b.owner_process.store(owner, Ordering::Relaxed);
                b.create_time_ns
                    .store(Timestamp::now().to_nanos(), Ordering::Relaxed);
                // SAFETY: the block mutex is held.
                unsafe { write_name(&b.name, name) };
                b.block_id.store(id, Ordering::Release);
                self.block_count.fetch_add(1, Ordering::Relaxed);
                return Some(id);
            }
        }
        None
    }

    fn unregister(&self, id: BlockId) {
        let _guard = self.mutex.lock();
        for b in &self.blocks {
            if b.block_id.load(Ordering::Relaxed) == id {
                b.block_id.store(0, Ordering::Release);
                self.block_count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }

    fn lookup(&self, id: BlockId) -> Option<BlockDescriptor> {
        let _guard = self.mutex.lock();
        self.blocks
            .iter()
            .find(|b| b.block_id.load(Ordering::Relaxed) == id && id != 0)
            .map(|b| BlockDescriptor {
                block_id: id,
                block_type: BlockType::from_u8(b.block_type.load(Ordering::Relaxed)),
                owner_process: b.owner_process.load(Ordering::Relaxed),
                create_time_ns: b.create_time_ns.load(Ordering::Relaxed),
                // SAFETY: the block mutex is held.
                name: unsafe { read_name(&b.name) },
            })
    }
}

// ===== connection registry =====

#[repr(C)]
struct ConnectionInfo {
    /// Connection id; 0 marks a free entry
    connection_id: AtomicU64,
    src_block: AtomicU32,
    src_port: AtomicU32,
    dst_block: AtomicU32,
    dst_port: AtomicU32,
    active: AtomicBool,
    _pad: [u8; 7],
    create_time_ns: AtomicU64,
}

/// Copy-out view of a connection entry. Purely informational; the data
/// path never consults it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub connection_id: ConnectionId,
    pub src_block: BlockId,
    pub src_port: u32,
    pub dst_block: BlockId,
    pub dst_port: u32,
    pub active: bool,
    pub create_time_ns: u64,
}

#[repr(C)]
struct ConnectionRegistry {
    mutex: ShmMutex,
    _pad: u32,
    connection_count: AtomicU32,
    next_connection_id: AtomicU64,
    connections: [ConnectionInfo; MAX_CONNECTIONS],
}

impl ConnectionRegistry {
    fn initialize(&self) {
        for c in &self.connections {
            c.connection_id.store(0, Ordering::Relaxed);
            c.active.store(false, Ordering::Relaxed);
        }
        self.connection_count.store(0, Ordering::Relaxed);
        self.next_connection_id.store(1, Ordering::Relaxed);
    }

    fn create(
        &self,
        src_block: BlockId,
        src_port: u32,
        dst_block: BlockId,
        dst_port: u32,
    ) -> Option<ConnectionId> {
        let _guard = self.mutex.lock();
        for c in &self.connections {
            if c.connection_id.load(Ordering::Relaxed) == 0 {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                c.src_block.store(src_block, Ordering::Relaxed);
                c.src_port.store(src_port, Ordering::Relaxed);
                c.dst_block.store(dst_block, Ordering::Relaxed);
                c.dst_port.store(dst_port, Ordering::Relaxed);
                c.active.store(true, Ordering::Relaxed);
                c.create_time_ns
                    .store(Timestamp::now().to_nanos(), Ordering::Relaxed);
                c.connection_id.store(id, Ordering::Release);
                self.connection_count.fetch_add(1, Ordering::Relaxed);
                return Some(id);
            }
        }
        None
    }

    fn delete(&self, id: ConnectionId) {
        let _guard = self.mutex.lock();
        for c in &self.connections {
            if c.connection_id.load(Ordering::Relaxed) == id && id != 0 {
                c.active.store(false, Ordering::Relaxed);
                c.connection_id.store(0, Ordering::Release);
                self.connection_count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }

    fn for_block(&self, block: BlockId) -> Vec<ConnectionDescriptor> {
        let _guard = self.mutex.lock();
        self.connections
            .iter()
            .filter(|c| {
                c.connection_id.load(Ordering::Relaxed) != 0
                    && (c.src_block.load(Ordering::Relaxed) == block
                        || c.dst_block.load(Ordering::Relaxed) == block)
            })
            .map(|c| ConnectionDescriptor {
                connection_id: c.connection_id.load(Ordering::Relaxed),
                src_block: c.src_block.load(Ordering::Relaxed),
                src_port: c.src_port.load(Ordering::Relaxed),
                dst_block: c.dst_block.load(Ordering::Relaxed),
                dst_port: c.dst_port.load(Ordering::Relaxed),
                active: c.active.load(Ordering::Relaxed),
                create_time_ns: c.create_time_ns.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ===== pool registry =====

#[repr(C)]
struct PoolDescSlot {
    /// Pool id == slot index; INVALID_POOL_ID marks a never-used slot
    pool_id: AtomicU32,
    /// Tombstone flag: a removed pool keeps its id but goes inactive
    active: AtomicBool,
    _pad: [u8; 3],
    block_size: AtomicU64,
    block_count: AtomicU64,
    shm_name: UnsafeCell<[u8; NAME_LEN]>,
}

/// Copy-out view of a pool descriptor.
#[derive(Debug, Clone)]
pub struct PoolDescriptor {
    pub pool_id: PoolId,
    pub block_size: u64,
    pub block_count: u64,
    pub shm_name: String,
    pub active: bool,
}

#[repr(C)]
struct PoolRegistry {
    mutex: ShmMutex,
    pool_count: AtomicU32,
    pools: [PoolDescSlot; MAX_BUFFER_POOLS],
}

impl PoolRegistry {
    fn initialize(&self) {
        for p in &self.pools {
            p.pool_id.store(INVALID_POOL_ID, Ordering::Relaxed);
            p.active.store(false, Ordering::Relaxed);
        }
        self.pool_count.store(0, Ordering::Relaxed);
    }

    fn register(&self, block_size: u64, block_count: u64, shm_name: &str) -> Option<PoolId> {
        let _guard = self.mutex.lock();
        for (i, p) in self.pools.iter().enumerate() {
            if p.pool_id.load(Ordering::Relaxed) == INVALID_POOL_ID {
                p.block_size.store(block_size, Ordering::Relaxed);
                p.block_count.store(block_count, Ordering::Relaxed);
                // SAFETY: the pool mutex is held.
                unsafe { write_name(&p.shm_name, shm_name) };
                p.active.store(true, Ordering::Relaxed);
                p.pool_id.store(i as PoolId, Ordering::Release);
                self.pool_count.fetch_add(1, Ordering::Relaxed);
                return Some(i as PoolId);
            }
        }
        None
    }

    fn unregister(&self, pool_id: PoolId) {
        let _guard = self.mutex.lock();
        if let Some(p) = self.pools.get(pool_id as usize) {
            if p.pool_id.load(Ordering::Relaxed) == pool_id {
                // Tombstone only: the id stays assigned for the life of
                // the registry so stale metadata keeps resolving.
                p.active.store(false, Ordering::Release);
                self.pool_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn descriptor(&self, pool_id: PoolId) -> Option<PoolDescriptor> {
        let _guard = self.mutex.lock();
        let p = self.pools.get(pool_id as usize)?;
        if p.pool_id.load(Ordering::Relaxed) != pool_id {
            return None;
        }
        Some(PoolDescriptor {
            pool_id,
            block_size: p.block_size.load(Ordering::Relaxed),
            block_count: p.block_count.load(Ordering::Relaxed),
            // SAFETY: the pool mutex is held.
            shm_name: unsafe { read_name(&p.shm_name) },
            active: p.active.load(Ordering::Relaxed),
        })
    }

    fn descriptors(&self) -> Vec<PoolDescriptor> {
        let _guard = self.mutex.lock();
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, p)| p.pool_id.load(Ordering::Relaxed) != INVALID_POOL_ID)
            .map(|(i, p)| PoolDescriptor {
                pool_id: i as PoolId,
                block_size: p.block_size.load(Ordering::Relaxed),
                block_count: p.block_count.load(Ordering::Relaxed),
                // SAFETY: the pool mutex is held.
                shm_name: unsafe { read_name(&p.shm_name) },
                active: p.active.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ===== root structure =====

#[repr(C)]
struct RegistryHeader {
    magic: u32,
    version: u32,
    total_size: u64,
    create_time_ns: u64,
    initialized: AtomicBool,
    _pad: [u8; 7],
}

/// The root shared structure. Never constructed by value; lives at offset
/// 0 of the registry segment.
#[repr(C)]
pub struct GlobalRegistry {
    header: RegistryHeader,
    processes: ProcessRegistry,
    blocks: BlockRegistry,
    connections: ConnectionRegistry,
    pools: PoolRegistry,
    metadata: MetadataTable,
}

// SAFETY: every mutable field is an atomic or an UnsafeCell written only
// under its sub-registry's cross-process mutex; concurrent access from
// multiple threads and processes is the design.
unsafe impl Send for GlobalRegistry {}
unsafe impl Sync for GlobalRegistry {}

/// Startup verification: the shared structures must have the layout every
/// peer expects. Mismatches mean an incompatible build and refuse to run.
fn platform_checks() -> Result<()> {
    if std::mem::size_of::<PoolHeader>() != 64 {
        return Err(ShmError::IncompatiblePlatform("PoolHeader must be 64 bytes"));
    }
    if std::mem::size_of::<ShmMutex>() != 4 {
        return Err(ShmError::IncompatiblePlatform("ShmMutex must be one futex word"));
    }
    if std::mem::align_of::<crate::metadata::BufferMeta>() != 64 {
        return Err(ShmError::IncompatiblePlatform(
            "BufferMeta must be cache-line aligned",
        ));
    }
    Ok(())
}

/// Per-process handle to the global registry segment.
pub struct Registry {
    segment: ShmSegment,
}

impl Registry {
    /// Attach to the default global registry, initializing it if this is
    /// the first process.
    pub fn init_or_attach() -> Result<Self> {
        Self::init_or_attach_named(GLOBAL_REGISTRY_NAME)
    }

    /// Attach to a registry under an explicit segment name (test
    /// isolation, multi-graph deployments).
    pub fn init_or_attach_named(name: &str) -> Result<Self> {
        platform_checks()?;

        let size = std::mem::size_of::<GlobalRegistry>();
        match ShmSegment::create(name, size) {
            Ok(segment) => {
                // First attacher: placement-initialize every table.
                // SAFETY: we own the freshly created zeroed segment
                // exclusively until `initialized` is published.
                let root = unsafe { &mut *(segment.as_ptr() as *mut GlobalRegistry) };
                root.header.magic = SHM_MAGIC;
                root.header.version = SHM_VERSION;
                root.header.total_size = size as u64;
                root.header.create_time_ns = Timestamp::now().to_nanos();

                root.processes.initialize();
                root.blocks.initialize();
                root.connections.initialize();
                root.pools.initialize();
                root.metadata.initialize();

                root.header.initialized.store(true, Ordering::Release);
                log::info!("[REGISTRY] initialized {name} ({size} bytes)");
                Ok(Self { segment })
            }
            Err(ShmError::SegmentExists(_)) => {
                let segment = ShmSegment::open(name)?;
                if segment.size() < size {
                    return Err(ShmError::SegmentIncompatible(name.to_string()));
                }
                // SAFETY: the segment is large enough for GlobalRegistry
                // and page-aligned; all access goes through atomics and
                // the embedded locks.
                let root = unsafe { &*(segment.as_ptr() as *const GlobalRegistry) };
                wait_initialized(&root.header.initialized, name)?;
                if root.header.magic != SHM_MAGIC || root.header.version != SHM_VERSION {
                    return Err(ShmError::SegmentIncompatible(name.to_string()));
                }
                log::debug!("[REGISTRY] attached to {name}");
                Ok(Self { segment })
            }
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn root(&self) -> &GlobalRegistry {
        // SAFETY: size validated at attach; the struct is designed for
        // concurrent shared access.
        unsafe { &*(self.segment.as_ptr() as *const GlobalRegistry) }
    }

    /// The buffer metadata table.
    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &MetadataTable {
        &self.root().metadata
    }

    /// Segment name of this registry.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Total registry segment size recorded by the creator.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.root().header.total_size
    }

    /// When the registry segment was first initialized, nanoseconds.
    #[must_use]
    pub fn created_at_ns(&self) -> u64 {
        self.root().header.create_time_ns
    }

    // ----- processes -----

    /// Register the calling process; returns its dense process id.
    pub fn register_process(&self, name: &str) -> Result<ProcessId> {
        self.root()
            .processes
            .register(name)
            .ok_or(ShmError::OutOfSlots)
    }

    /// Release a process table entry.
    pub fn unregister_process(&self, id: ProcessId) {
        self.root().processes.unregister(id);
    }

    /// Refresh the heartbeat of a registered process and mark it running.
    pub fn heartbeat(&self, id: ProcessId) {
        if let Some(p) = self.root().processes.entry(id) {
            p.last_heartbeat_ns
                .store(Timestamp::now().to_nanos(), Ordering::Release);
            p.state.store(ProcessState::Running as u8, Ordering::Relaxed);
        }
    }

    /// Liveness predicate: heartbeat older than the dead-process timeout.
    #[must_use]
    pub fn is_dead(&self, id: ProcessId, now: Timestamp) -> bool {
        match self.root().processes.entry(id) {
            Some(p) => {
                let last = p.last_heartbeat_ns.load(Ordering::Acquire);
                now.to_nanos().saturating_sub(last) > DEAD_PROCESS_TIMEOUT.as_nanos() as u64
            }
            None => true,
        }
    }

    /// Copy-out view of a registered process.
    #[must_use]
    pub fn process_descriptor(&self, id: ProcessId) -> Option<ProcessDescriptor> {
        let reg = &self.root().processes;
        let _guard = reg.mutex.lock();
        reg.entry(id).map(|p| ProcessDescriptor {
            process_id: id,
            state: ProcessState::from_u8(p.state.load(Ordering::Relaxed)),
            native_pid: p.native_pid.load(Ordering::Relaxed),
            last_heartbeat_ns: p.last_heartbeat_ns.load(Ordering::Relaxed),
            start_time_ns: p.start_time_ns.load(Ordering::Relaxed),
            // SAFETY: the process mutex is held.
            name: unsafe { read_name(&p.name) },
        })
    }

    /// Number of registered processes.
    #[must_use]
    pub fn process_count(&self) -> u32 {
        self.root().processes.process_count.load(Ordering::Acquire)
    }

    /// Ids of registered processes whose heartbeat has expired.
    #[must_use]
    pub fn find_dead_processes(&self, now: Timestamp) -> Vec<ProcessId> {
        let reg = &self.root().processes;
        let mut dead = Vec::new();
        for (i, p) in reg.processes.iter().enumerate() {
            let id = p.process_id.load(Ordering::Acquire);
            if id == (i + 1) as u32 && self.is_dead(id, now) {
                dead.push(id);
            }
        }
        dead
    }

    // ----- pools -----

    /// Record a pool descriptor; returns the dense pool id.
    pub fn register_pool(
        &self,
        block_size: u64,
        block_count: u64,
        shm_name: &str,
    ) -> Result<PoolId> {
        self.root()
            .pools
            .register(block_size, block_count, shm_name)
            .ok_or(ShmError::OutOfSlots)
    }

    /// Tombstone a pool descriptor. The segment is not unlinked.
    pub fn unregister_pool(&self, pool_id: PoolId) {
        self.root().pools.unregister(pool_id);
    }

    /// Copy-out view of one pool descriptor.
    #[must_use]
    pub fn pool_descriptor(&self, pool_id: PoolId) -> Option<PoolDescriptor> {
        self.root().pools.descriptor(pool_id)
    }

    /// Copy-out view of every assigned pool descriptor (active and
    /// tombstoned), ordered by pool id.
    #[must_use]
    pub fn pool_descriptors(&self) -> Vec<PoolDescriptor> {
        self.root().pools.descriptors()
    }

    // ----- blocks -----

    /// Register a block; returns its id.
    pub fn register_block(
        &self,
        name: &str,
        block_type: BlockType,
        owner: ProcessId,
    ) -> Result<BlockId> {
        self.root()
            .blocks
            .register(name, block_type, owner)
            .ok_or(ShmError::OutOfSlots)
    }

    /// Remove a block entry.
    pub fn unregister_block(&self, id: BlockId) {
        self.root().blocks.unregister(id);
    }

    /// Copy-out view of a block entry.
    #[must_use]
    pub fn block_descriptor(&self, id: BlockId) -> Option<BlockDescriptor> {
        self.root().blocks.lookup(id)
    }

    // ----- connections -----

    /// Record a connection between two ports.
    pub fn create_connection(
        &self,
        src_block: BlockId,
        src_port: u32,
        dst_block: BlockId,
        dst_port: u32,
    ) -> Result<ConnectionId> {
        self.root()
            .connections
            .create(src_block, src_port, dst_block, dst_port)
            .ok_or(ShmError::OutOfSlots)
    }

    /// Delete a connection entry.
    pub fn delete_connection(&self, id: ConnectionId) {
        self.root().connections.delete(id);
    }

    /// Connections touching a block (either endpoint).
    #[must_use]
    pub fn connections_for_block(&self, block: BlockId) -> Vec<ConnectionDescriptor> {
        self.root().connections.for_block(block)
    }

    /// Unlink a registry segment by name. Idempotent; live mappings stay
    /// valid until the holders exit.
    pub fn remove(name: &str) -> Result<()> {
        ShmSegment::unlink(name)
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mqshm - Multi-process shared-memory streaming runtime
//!
//! A shared-memory substrate for dataflow graphs that span multiple OS
//! processes: fixed-size buffer pools, a cross-process buffer metadata
//! table with atomic reference counts, and broadcast port queues that
//! carry buffer ids between processing nodes without serialization.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqshm::{Registry, ShmConfig, ShmManager, PortQueue, Result};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     // Attach to (or initialize) the global registry
//!     let registry = Arc::new(Registry::init_or_attach()?);
//!     let process_id = registry.register_process("producer")?;
//!
//!     // Per-process manager: creates the configured pools
//!     let manager = ShmManager::new(registry, process_id, ShmConfig::default_config())?;
//!
//!     // Allocate a buffer, fill it, broadcast it
//!     let mut buf = manager.allocate(1024)?;
//!     buf.data_mut()[..5].copy_from_slice(b"hello");
//!
//!     let queue = PortQueue::create("mqshm_port_1_0_2_0", 1, 64, manager.allocator())?;
//!     queue.push(&buf)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  Process A                |  Process B                              |
//! |  ShmManager / Handles     |  ShmManager / Handles                   |
//! +---------------------------------------------------------------------+
//! |                     Shared memory segments                          |
//! |  GlobalRegistry (processes, blocks, connections, pools, metadata)   |
//! |  BufferPool[n]  (slab of fixed-size blocks + LIFO free list)        |
//! |  PortQueue[m]   (broadcast ring of buffer ids, per-consumer heads)  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Registry`] | Per-process handle to the global registry segment |
//! | [`ShmManager`] | Per-process facade: pool management and buffer allocation |
//! | [`BufferHandle`] | RAII smart reference to a shared buffer (one refcount unit) |
//! | [`PortQueue`] | Broadcast ring queue; every consumer sees every buffer |
//! | [`BufferPool`] | Fixed-size block slab in one shared-memory segment |
//!
//! ## Guarantees
//!
//! - **Zero-copy**: payloads live in pool blocks; only 64-bit buffer ids
//!   cross the queues.
//! - **Crash-aware**: producer ownership claims carry the owner pid; stale
//!   segments from dead producers are reclaimed on the next create.
//! - **Bounded**: a producer can never run more than `capacity` entries
//!   ahead of its slowest active consumer.

#[cfg(not(target_os = "linux"))]
compile_error!("mqshm requires Linux (POSIX shared memory + futex).");

#[cfg(target_endian = "big")]
compile_error!("mqshm segment headers assume a little-endian target.");

#[cfg(not(target_has_atomic = "64"))]
compile_error!("mqshm requires lock-free 64-bit atomics for cross-process refcounts.");

/// Capacity constants, magic numbers, segment naming, pool configuration.
pub mod config;
/// Error taxonomy shared by all components.
pub mod error;
/// Process-local RAII reference to a shared buffer.
pub mod handle;
/// Per-process buffer allocation facade and pool management.
pub mod manager;
/// Buffer metadata table with atomic reference counts.
pub mod metadata;
/// Process-wide operation counters.
pub mod metrics;
/// Fixed-size block pools in shared memory.
pub mod pool;
/// OS process id helpers (liveness probing).
pub mod process;
/// Broadcast port queues carrying buffer ids between blocks.
pub mod queue;
/// Global registry: processes, blocks, connections, pool descriptors.
pub mod registry;
/// Named shared-memory segment primitive.
pub mod segment;
/// Cross-process mutex and condition variable (futex-based).
pub mod sync;
/// Nanosecond timestamps and time ranges stored in buffer metadata.
pub mod timestamp;

pub use config::{PoolConfig, ShmConfig};
pub use error::{Result, ShmError};
pub use handle::BufferHandle;
pub use manager::{BufferAllocator, PoolStats, ShmManager, ShmStats};
pub use metrics::{global_metrics, ShmMetrics, ShmMetricsSnapshot};
pub use pool::BufferPool;
pub use queue::{cleanup_stale_segments, PortQueue};
pub use registry::Registry;
pub use segment::ShmSegment;
pub use timestamp::{TimeRange, Timestamp};

/// Dense process identifier assigned by the registry (not an OS pid).
pub type ProcessId = u32;
/// Identifier of a processing node in the dataflow graph.
pub type BlockId = u32;
/// Identifier of a block port.
pub type PortId = u32;
/// Dense index of a pool descriptor in the registry.
pub type PoolId = u32;
/// Globally unique, never-recycled buffer identifier. Zero is the sentinel.
pub type BufferId = u64;
/// Identifier of a connection between two ports.
pub type ConnectionId = u64;
/// Consumer slot index local to one port queue.
pub type ConsumerId = u32;

/// Invalid / sentinel buffer id.
pub const INVALID_BUFFER_ID: BufferId = 0;
/// Invalid pool id sentinel.
pub const INVALID_POOL_ID: PoolId = PoolId::MAX;

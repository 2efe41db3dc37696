// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration - single source of truth.
//!
//! This module centralizes all capacity constants, magic numbers and
//! segment naming. **Never hardcode these elsewhere.**
//!
//! Capacity constants size the fixed tables inside the global registry
//! segment; changing them changes the segment layout, so every process in
//! a deployment must be built with the same values.

use std::time::Duration;

// =======================================================================
// Magic and version
// =======================================================================

/// Magic number stamped at offset 0 of every segment header ("MQSH").
pub const SHM_MAGIC: u32 = 0x4D51_5348;

/// Layout version: `[major(16bit)][minor(16bit)]`. Openers reject a
/// mismatched major.
pub const SHM_VERSION: u32 = 0x0002_0000;

// =======================================================================
// Capacity constants (segment layout - keep in sync across processes)
// =======================================================================

/// Maximum registered processes.
pub const MAX_PROCESSES: usize = 64;

/// Maximum registered blocks.
pub const MAX_BLOCKS: usize = 256;

/// Maximum connections.
pub const MAX_CONNECTIONS: usize = 1024;

/// Maximum live buffers (metadata table capacity).
pub const MAX_BUFFERS: usize = 4096;

/// Maximum buffer pools.
pub const MAX_BUFFER_POOLS: usize = 8;

/// Maximum consumers per port queue.
pub const MAX_CONSUMERS_PER_QUEUE: usize = 16;

/// Default port queue capacity (ring entries).
pub const DEFAULT_PORT_QUEUE_SIZE: usize = 64;

/// Cache line size used for alignment of shared structures.
pub const CACHE_LINE: usize = 64;

// =======================================================================
// Segment naming
// =======================================================================

/// Global registry segment name.
pub const GLOBAL_REGISTRY_NAME: &str = "mqshm_global_registry";

/// Prefix for buffer pool segments.
pub const POOL_NAME_PREFIX: &str = "mqshm_pool_";

/// Prefix for port queue segments.
pub const PORT_NAME_PREFIX: &str = "mqshm_port_";

/// Maximum segment name length (printable ASCII, no null terminator).
pub const MAX_SHM_NAME_LEN: usize = 63;

/// Segment name for a user-named buffer pool.
#[must_use]
pub fn pool_segment_name(name: &str) -> String {
    format!("{POOL_NAME_PREFIX}{name}")
}

/// Deterministic segment name for the queue between two ports.
///
/// Both endpoints can reconstruct the name from the connection endpoints
/// without coordination.
#[must_use]
pub fn port_segment_name(src_block: u32, src_port: u32, dst_block: u32, dst_port: u32) -> String {
    format!("{PORT_NAME_PREFIX}{src_block}_{src_port}_{dst_block}_{dst_port}")
}

// =======================================================================
// Timeouts and liveness
// =======================================================================

/// How long an opener waits for a creator to publish `initialized`.
pub const INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Expected heartbeat cadence for registered processes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// A process whose heartbeat is older than this is considered dead.
pub const DEAD_PROCESS_TIMEOUT: Duration = Duration::from_millis(3000);

/// Poll step for `pop_with_timeout`.
pub const POP_POLL_INTERVAL: Duration = Duration::from_micros(10);

// =======================================================================
// Pool configuration
// =======================================================================

/// Configuration of one buffer pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name; the segment is named `mqshm_pool_<name>`.
    pub name: String,
    /// Size of each block in bytes.
    pub block_size: usize,
    /// Number of blocks. Fixed for the life of the pool.
    pub block_count: usize,
}

impl PoolConfig {
    /// Create a pool configuration.
    #[must_use]
    pub fn new(name: &str, block_size: usize, block_count: usize) -> Self {
        Self {
            name: name.to_string(),
            block_size,
            block_count,
        }
    }
}

/// Configuration for a [`crate::ShmManager`].
#[derive(Debug, Clone, Default)]
pub struct ShmConfig {
    /// Pools created (or opened) by the manager at startup.
    pub pools: Vec<PoolConfig>,
}

impl ShmConfig {
    /// Empty configuration: the manager maps pools lazily as peers
    /// register them, but creates none itself.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default three-tier pool set.
    ///
    /// - `small`:  4 KiB x 1024
    /// - `medium`: 64 KiB x 512
    /// - `large`:  1 MiB x 128
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            pools: vec![
                PoolConfig::new("small", 4096, 1024),
                PoolConfig::new("medium", 65536, 512),
                PoolConfig::new("large", 1_048_576, 128),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_spells_mqsh() {
        assert_eq!(&SHM_MAGIC.to_be_bytes(), b"MQSH");
    }

    #[test]
    fn test_port_segment_name() {
        assert_eq!(port_segment_name(1, 0, 2, 3), "mqshm_port_1_0_2_3");
    }

    #[test]
    fn test_pool_segment_name() {
        assert_eq!(pool_segment_name("small"), "mqshm_pool_small");
    }

    #[test]
    fn test_registry_name_fits() {
        assert!(GLOBAL_REGISTRY_NAME.len() <= MAX_SHM_NAME_LEN);
    }

    #[test]
    fn test_default_config_ordering() {
        let config = ShmConfig::default_config();
        assert_eq!(config.pools.len(), 3);
        // Ascending block sizes so first-fit selection is also smallest-fit
        for pair in config.pools.windows(2) {
            assert!(pair[0].block_size < pair[1].block_size);
        }
    }
}

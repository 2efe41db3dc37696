// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the shared-memory runtime.
//!
//! Every component boundary returns these as explicit values; there are no
//! silent defaults. Resource exhaustion (`OutOfBlocks`, `OutOfSlots`,
//! `QueueFull`) is a normal, recoverable condition that producers handle as
//! backpressure. Handle-drop paths never surface errors; anomalies on that
//! path are logged and abandoned.

use std::fmt;
use std::io;

/// Errors that can occur in shared-memory runtime operations.
#[derive(Debug)]
pub enum ShmError {
    /// Segment name already exists on create
    SegmentExists(String),

    /// Segment name absent on open
    SegmentMissing(String),

    /// Magic/version mismatch, or `initialized` never observed in time
    SegmentIncompatible(String),

    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Ownership claim refused: the queue's producer is still alive
    ProducerAlreadyLive { segment: String, pid: u32 },

    /// Buffer pool exhausted
    OutOfBlocks { pool_id: u32 },

    /// Metadata table (or consumer slot table) exhausted
    OutOfSlots,

    /// No active pool has a large enough block size
    NoPoolFits { requested: usize },

    /// Timed push expired with the queue still full
    QueueFull,

    /// Non-blocking or timed pop with nothing to read
    QueueEmpty,

    /// Push/pop on a closed queue
    Closed,

    /// Pop with an unknown or inactive consumer id
    NotRegistered { consumer: u32 },

    /// Buffer id is invalid, recycled, or already released
    BufferGone { buffer_id: u64 },

    /// Invalid segment name (length, characters)
    InvalidName(String),

    /// Invalid capacity or block geometry
    InvalidCapacity(usize),

    /// Startup layout/atomics verification failed. Not recoverable.
    IncompatiblePlatform(&'static str),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentExists(name) => write!(f, "Segment already exists: {name}"),
            Self::SegmentMissing(name) => write!(f, "Segment not found: {name}"),
            Self::SegmentIncompatible(name) => {
                write!(f, "Segment incompatible (magic/version/init): {name}")
            }
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::ProducerAlreadyLive { segment, pid } => {
                write!(f, "Producer pid {pid} still owns queue segment {segment}")
            }
            Self::OutOfBlocks { pool_id } => write!(f, "Pool {pool_id} has no free blocks"),
            Self::OutOfSlots => write!(f, "No free slots available"),
            Self::NoPoolFits { requested } => {
                write!(f, "No active pool fits a {requested} byte buffer")
            }
            Self::QueueFull => write!(f, "Queue full (timed push expired)"),
            Self::QueueEmpty => write!(f, "Queue empty"),
            Self::Closed => write!(f, "Queue closed"),
            Self::NotRegistered { consumer } => {
                write!(f, "Consumer {consumer} is not registered on this queue")
            }
            Self::BufferGone { buffer_id } => {
                write!(f, "Buffer {buffer_id} is gone (invalid or released)")
            }
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::InvalidCapacity(cap) => write!(f, "Invalid capacity: {cap}"),
            Self::IncompatiblePlatform(what) => {
                write!(f, "Platform verification failed: {what}")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for shared-memory runtime operations.
pub type Result<T> = std::result::Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = ShmError::NoPoolFits { requested: 4097 };
        assert!(e.to_string().contains("4097"));

        let e = ShmError::ProducerAlreadyLive {
            segment: "mqshm_port_1_0_2_0".into(),
            pid: 1234,
        };
        assert!(e.to_string().contains("1234"));
        assert!(e.to_string().contains("mqshm_port_1_0_2_0"));
    }

    #[test]
    fn test_io_source_preserved() {
        use std::error::Error;
        let e = ShmError::Mmap(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(e.source().is_some());
    }
}

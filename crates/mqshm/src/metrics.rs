// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime metrics.
//!
//! Process-wide atomic counters for allocation and queue traffic. All
//! counters use `Relaxed` ordering; values are eventually consistent
//! across threads and meant for reporting, not for control flow.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared-memory runtime metrics with atomic counters.
#[derive(Debug, Default)]
pub struct ShmMetrics {
    /// Buffers allocated (handle returned to a caller)
    pub buffers_allocated: AtomicU64,
    /// Buffers released back to their pool
    pub buffers_released: AtomicU64,
    /// Allocation attempts that hit an exhausted pool
    pub alloc_failures: AtomicU64,
    /// Buffer ids pushed into port queues
    pub queue_pushes: AtomicU64,
    /// Buffer ids popped from port queues
    pub queue_pops: AtomicU64,
    /// Producer blocks on a full queue
    pub queue_full_waits: AtomicU64,
}

impl ShmMetrics {
    /// New metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffers_allocated: AtomicU64::new(0),
            buffers_released: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            queue_pushes: AtomicU64::new(0),
            queue_pops: AtomicU64::new(0),
            queue_full_waits: AtomicU64::new(0),
        }
    }

    /// Increment the allocated-buffers counter.
    #[inline]
    pub fn inc_allocated(&self) {
        self.buffers_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the released-buffers counter.
    #[inline]
    pub fn inc_released(&self) {
        self.buffers_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the allocation-failure counter.
    #[inline]
    pub fn inc_alloc_failures(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the queue-push counter.
    #[inline]
    pub fn inc_pushes(&self) {
        self.queue_pushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the queue-pop counter.
    #[inline]
    pub fn inc_pops(&self) {
        self.queue_pops.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the full-queue wait counter.
    #[inline]
    pub fn inc_full_waits(&self) {
        self.queue_full_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.buffers_allocated.store(0, Ordering::Relaxed);
        self.buffers_released.store(0, Ordering::Relaxed);
        self.alloc_failures.store(0, Ordering::Relaxed);
        self.queue_pushes.store(0, Ordering::Relaxed);
        self.queue_pops.store(0, Ordering::Relaxed);
        self.queue_full_waits.store(0, Ordering::Relaxed);
    }

    /// Non-atomic snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ShmMetricsSnapshot {
        ShmMetricsSnapshot {
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            queue_pushes: self.queue_pushes.load(Ordering::Relaxed),
            queue_pops: self.queue_pops.load(Ordering::Relaxed),
            queue_full_waits: self.queue_full_waits.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of runtime metrics (plain values, for reporting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmMetricsSnapshot {
    pub buffers_allocated: u64,
    pub buffers_released: u64,
    pub alloc_failures: u64,
    pub queue_pushes: u64,
    pub queue_pops: u64,
    pub queue_full_waits: u64,
}

impl ShmMetricsSnapshot {
    /// Buffers still alive according to the counters.
    #[must_use]
    pub fn buffers_live(&self) -> u64 {
        self.buffers_allocated.saturating_sub(self.buffers_released)
    }
}

static GLOBAL: ShmMetrics = ShmMetrics::new();

/// Process-wide metrics instance.
#[must_use]
pub fn global_metrics() -> &'static ShmMetrics {
    &GLOBAL
}

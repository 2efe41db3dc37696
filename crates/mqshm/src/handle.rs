// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-local smart reference to a shared buffer.
//!
//! A valid [`BufferHandle`] owns exactly one unit of the buffer's
//! cross-process reference count. Cloning takes another unit; dropping
//! returns one, and whichever drop observes the count reach zero returns
//! the block to its pool and the metadata slot to the table.
//!
//! The handle caches the metadata slot index and the process-local data
//! pointer at construction, so every accessor is O(1). The cached pointer
//! is only meaningful inside the owning process; the buffer id is the
//! cross-process name.
//!
//! An "empty" handle (`is_valid() == false`) is the result of looking up
//! an unknown or already-released buffer id; its data slice is empty and
//! its drop is a no-op.

use crate::manager::BufferAllocator;
use crate::timestamp::{TimeRange, Timestamp};
use crate::{BufferId, INVALID_BUFFER_ID};
use std::sync::Arc;

/// RAII reference to a buffer in shared memory.
pub struct BufferHandle {
    id: BufferId,
    /// Cached metadata slot; validated against `id` on each access
    slot: u32,
    allocator: Option<Arc<BufferAllocator>>,
    /// Cached process-local data pointer
    data: *mut u8,
    /// Cached requested size in bytes
    len: usize,
}

// SAFETY: the handle is a (buffer_id, Arc, pointer-into-shm) triple. The
// refcount it owns is process-agnostic and the shared block outlives the
// handle by construction; concurrent readers of the data region are the
// documented contract of the runtime (producers hand off via queues).
unsafe impl Send for BufferHandle {}
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    /// The empty handle.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: INVALID_BUFFER_ID,
            slot: 0,
            allocator: None,
            data: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// Wrap a freshly allocated buffer, taking ownership of the initial
    /// refcount unit written by the allocator (no additional `add_ref`).
    pub(crate) fn claim(id: BufferId, slot: u32, allocator: Arc<BufferAllocator>) -> Self {
        Self::wrap(id, slot, allocator)
    }

    /// Wrap a buffer id popped from a queue, adopting the refcount unit
    /// the producer bumped for this consumer (no additional `add_ref`).
    pub(crate) fn adopt(id: BufferId, allocator: Arc<BufferAllocator>) -> Self {
        match allocator.lookup(id) {
            Ok(slot) => Self::wrap(id, slot, allocator),
            Err(_) => {
                // The unit we were supposed to adopt has nothing behind
                // it; surface an empty handle rather than guessing.
                log::warn!("[HANDLE] adopting unknown buffer {id}");
                Self::empty()
            }
        }
    }

    /// Construct from a known buffer id, taking a new refcount unit.
    ///
    /// Yields the empty handle when the id is unknown or the buffer was
    /// already invalidated.
    #[must_use]
    pub fn open(id: BufferId, allocator: Arc<BufferAllocator>) -> Self {
        let Ok(slot) = allocator.lookup(id) else {
            return Self::empty();
        };
        let meta = allocator.registry().metadata().entry(slot);
        if !meta.is_valid() {
            return Self::empty();
        }
        meta.add_ref();
        Self::wrap(id, slot, allocator)
    }

    fn wrap(id: BufferId, slot: u32, allocator: Arc<BufferAllocator>) -> Self {
        let meta = allocator.registry().metadata().entry(slot);
        let len = meta.size() as usize;
        match allocator.data_ptr(slot, id) {
            Ok(data) => Self {
                id,
                slot,
                allocator: Some(allocator),
                data,
                len,
            },
            Err(e) => {
                // We own a refcount unit but cannot map the data; give
                // the unit back and degrade to the empty handle.
                log::error!("[HANDLE] no local mapping for buffer {id}: {e}");
                allocator.remove_ref(id).ok();
                Self::empty()
            }
        }
    }

    /// Whether this handle references a live buffer.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id != INVALID_BUFFER_ID && self.allocator.is_some() && !self.data.is_null()
    }

    /// The buffer id (0 for the empty handle).
    #[inline]
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Requested size in bytes (not the pool block size).
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.len
    }

    /// The buffer content. Empty slice for the empty handle.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        if !self.is_valid() {
            return &[];
        }
        // SAFETY: data points at a pool block of at least `len` bytes
        // that stays allocated while this handle holds its refcount unit.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Mutable view of the buffer content. Empty slice for the empty
    /// handle. Writers coordinate through queue hand-off: a producer
    /// fills the buffer before pushing, consumers treat it as read-only.
    pub fn data_mut(&mut self) -> &mut [u8] {
        if !self.is_valid() {
            return &mut [];
        }
        // SAFETY: as in `data`; exclusivity within this process follows
        // from &mut self, and cross-process exclusivity from the hand-off
        // protocol above.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }

    fn meta(&self) -> Option<&crate::metadata::BufferMeta> {
        let allocator = self.allocator.as_ref()?;
        let meta = allocator.registry().metadata().entry(self.slot);
        (meta.buffer_id() == self.id).then_some(meta)
    }

    /// Current cross-process reference count (0 for the empty handle).
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.meta().map_or(0, |m| m.refcount())
    }

    /// Buffer timestamp; zero when unset.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.meta().map_or_else(Timestamp::default, |m| m.timestamp())
    }

    /// Stamp the buffer with a single-point timestamp.
    pub fn set_timestamp(&self, ts: Timestamp) {
        if let Some(meta) = self.meta() {
            meta.set_timestamp(ts);
        }
    }

    /// Time range attached to the buffer, if any.
    #[must_use]
    pub fn time_range(&self) -> Option<TimeRange> {
        self.meta().and_then(|m| m.time_range())
    }

    /// Attach a time range to the buffer.
    pub fn set_time_range(&self, range: TimeRange) {
        if let Some(meta) = self.meta() {
            meta.set_time_range(range);
        }
    }
}

impl Clone for BufferHandle {
    fn clone(&self) -> Self {
        if let (Some(allocator), Some(meta)) = (self.allocator.as_ref(), self.meta()) {
            meta.add_ref();
            Self {
                id: self.id,
                slot: self.slot,
                allocator: Some(Arc::clone(allocator)),
                data: self.data,
                len: self.len,
            }
        } else {
            Self::empty()
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if self.id == INVALID_BUFFER_ID {
            return;
        }
        if let Some(allocator) = self.allocator.take() {
            // remove_ref releases block and slot on the zero transition.
            // The drop path is infallible: a failed lookup means a peer
            // already tore the buffer down, which we log and abandon.
            if let Err(e) = allocator.remove_ref(self.id) {
                log::warn!("[HANDLE] drop of buffer {}: {e}", self.id);
            }
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("size", &self.len)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A reference-counted handle to a chunk. Cloning shares ownership and
//! bumps the header's atomic ref-count; dropping the last handle returns
//! the chunk to its origin pool. Because the ref-count lives inside the
//! [`ChunkHeader`] in shared memory, this is correct even when the clones
//! are held by different processes.

use crate::chunk_header::ChunkHeader;
use crate::mem_pool_collection::MemPoolCollection;
use chunkbus_cal::shm_allocator::{PointerOffset, SegmentId};
use core::ptr::NonNull;
use std::sync::Arc;

pub struct SharedChunk {
    header: NonNull<ChunkHeader>,
    pools: Arc<MemPoolCollection>,
    segment_id: SegmentId,
}

// `header` points into a shared memory segment whose payload every pool that can reach this
// chunk synchronizes through atomics; `pools` is itself `Send + Sync`.
unsafe impl Send for SharedChunk {}
unsafe impl Sync for SharedChunk {}

impl SharedChunk {
    pub(crate) fn new(
        header: NonNull<ChunkHeader>,
        pools: Arc<MemPoolCollection>,
        segment_id: SegmentId,
    ) -> Self {
        Self {
            header,
            pools,
            segment_id,
        }
    }

    fn header(&self) -> &ChunkHeader {
        unsafe { self.header.as_ref() }
    }

    /// Id of the segment this chunk was allocated from.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// This chunk's address as a `{segment_id, offset}` pair, resolvable by any process that
    /// has this segment mapped — see the relative pointer protocol in the crate docs.
    pub fn relative_offset(&self) -> PointerOffset {
        let base = self.pools.segment_base_address();
        let relative = self.header.as_ptr() as usize - base;
        PointerOffset::new_with_segment_id(relative, self.segment_id)
    }

    pub fn chunk_size(&self) -> usize {
        self.header().chunk_size()
    }

    pub fn pool_id(&self) -> u32 {
        self.header().pool_id()
    }

    pub fn ref_count(&self) -> u64 {
        self.header().ref_count()
    }

    pub fn sequence_number(&self) -> u64 {
        self.header().sequence_number()
    }

    pub fn set_sequence_number(&self, value: u64) {
        self.header().set_sequence_number(value);
    }

    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        unsafe { core::slice::from_raw_parts(header.payload_ptr(), header.payload_size()) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.header();
        unsafe { core::slice::from_raw_parts_mut(header.payload_ptr(), header.payload_size()) }
    }

    pub fn user_header(&self) -> Option<&[u8]> {
        let header = self.header();
        unsafe { header.user_header_ptr() }
            .map(|ptr| unsafe { core::slice::from_raw_parts(ptr, header.user_header_size()) })
    }

    pub fn user_header_mut(&mut self) -> Option<&mut [u8]> {
        let header = self.header();
        unsafe { header.user_header_ptr() }
            .map(|ptr| unsafe { core::slice::from_raw_parts_mut(ptr, header.user_header_size()) })
    }

    /// Identity used by [`crate::port`]'s used-chunk list bookkeeping: two handles referring to
    /// the same underlying chunk compare equal.
    pub(crate) fn header_ptr(&self) -> NonNull<ChunkHeader> {
        self.header
    }

    /// Increments the shared ref-count without producing an owned handle. Used by
    /// [`crate::port::used_chunk_list::UsedChunkList`]: registering a chunk in the crash-safe
    /// list represents one more share of it, but the list itself only stores the chunk's
    /// relative offset, not a live [`SharedChunk`] — the share is reconstructed later, on
    /// `remove`/`cleanup`, via [`crate::mem_pool_collection::PoolSet::reconstruct()`].
    pub(crate) fn bump_ref_count_for_list(&self) {
        self.header().increment_ref_count();
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        self.header().increment_ref_count();
        Self {
            header: self.header,
            pools: Arc::clone(&self.pools),
            segment_id: self.segment_id,
        }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        if self.header().decrement_ref_count() == 0 {
            unsafe { self.pools.release(self.header) };
        }
    }
}

impl core::fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedChunk")
            .field("pool_id", &self.pool_id())
            .field("chunk_size", &self.chunk_size())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An ordered collection of [`MemPool`]s, one per configured chunk size,
//! sorted ascending so [`MemPoolCollection::allocate()`] can pick the
//! smallest pool that fits a requested layout in a single linear scan.

use crate::chunk_header::ChunkHeader;
use crate::chunk_layout::{self, ChunkLayout};
use crate::error::AllocError;
use crate::mem_pool::{MemPool, MemPoolAllocError};
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::shm_allocator::SegmentId;
use core::ptr::NonNull;
use std::sync::Arc;

/// One `{chunk_size, chunk_count}` entry of a [`PoolConfig`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PoolConfigEntry {
    pub chunk_size: usize,
    pub chunk_count: usize,
}

/// The set of pool sizes a [`crate::segment::Segment`] is built with.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PoolConfig {
    pub entries: Vec<PoolConfigEntry>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, chunk_size: usize, chunk_count: usize) -> Self {
        self.entries.push(PoolConfigEntry {
            chunk_size,
            chunk_count,
        });
        self
    }
}

#[derive(Debug)]
pub struct MemPoolCollection {
    // sorted ascending by chunk_size; index into this vec is the `pool_id` stored in
    // every ChunkHeader allocated from it.
    pools: Vec<MemPool>,
}

impl MemPoolCollection {
    /// Builds one [`MemPool`] per entry of `pool_config`, sorted ascending by chunk size, placed
    /// back-to-back starting at `chunk_region_relative_offset` inside the segment.
    ///
    /// # Safety
    /// `segment_base_address + chunk_region_relative_offset` must address at least
    /// [`crate::segment::Segment::required_chunk_memory_size`]`(pool_config)` bytes, owned
    /// exclusively by this collection for its lifetime.
    pub(crate) unsafe fn new(
        pool_config: &PoolConfig,
        chunk_region_relative_offset: usize,
        segment_base_address: usize,
    ) -> Self {
        let mut entries = pool_config.entries.clone();
        entries.sort_by_key(|e| e.chunk_size);

        let mut pools = Vec::with_capacity(entries.len());
        let mut relative_offset = chunk_region_relative_offset;
        for entry in entries {
            pools.push(unsafe {
                MemPool::new(
                    entry.chunk_size,
                    entry.chunk_count,
                    relative_offset,
                    segment_base_address,
                )
            });
            relative_offset += entry.chunk_size * entry.chunk_count;
        }

        Self { pools }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool(&self, pool_id: usize) -> Option<&MemPool> {
        self.pools.get(pool_id)
    }

    /// Absolute address, in this process, that every pool in this collection addresses its
    /// chunks relative to. Every pool in one collection shares the same segment base address;
    /// a collection always has at least one configured pool.
    pub(crate) fn segment_base_address(&self) -> usize {
        self.pools[0].segment_base_address()
    }

    /// Total chunks in flight across every pool in this collection.
    pub fn used(&self) -> usize {
        self.pools.iter().map(MemPool::used).sum()
    }

    fn find_fitting_pool(&self, required_size: usize) -> Option<usize> {
        self.pools
            .iter()
            .position(|pool| pool.chunk_size() >= required_size)
    }

    fn allocate(
        &self,
        payload_size: usize,
        payload_align: usize,
        user_header_size: usize,
        user_header_align: usize,
    ) -> Result<(NonNull<ChunkHeader>, ChunkLayout), AllocError> {
        let header_size = core::mem::size_of::<ChunkHeader>();
        let header_align = core::mem::align_of::<ChunkHeader>();
        let layout = chunk_layout::compute(
            header_size,
            header_align,
            payload_size,
            payload_align,
            user_header_size,
            user_header_align,
        );

        let pool_id = self
            .find_fitting_pool(layout.total_size)
            .ok_or(AllocError::PayloadTooLarge)?;

        let header = self.pools[pool_id]
            .allocate(pool_id as u32, &layout)
            .map_err(|MemPoolAllocError::RunningOutOfChunks| AllocError::RunningOutOfChunks)?;

        Ok((header, layout))
    }

    /// # Safety
    /// `header` must have been allocated from one of this collection's pools and not already
    /// released.
    pub(crate) unsafe fn release(&self, header: NonNull<ChunkHeader>) {
        let pool_id = unsafe { header.as_ref() }.pool_id() as usize;
        unsafe { self.pools[pool_id].release(header) };
    }
}

/// A cloneable handle to one segment's [`MemPoolCollection`], returned by
/// [`crate::segment_manager::SegmentManager::writable_segment()`] as the `pool_set` a producer
/// loans chunks from. Carries the owning segment's id so every [`SharedChunk`] it hands out can
/// be addressed as a `{segment_id, offset}` relative pointer by the port layer.
#[derive(Debug, Clone)]
pub struct PoolSet {
    pools: Arc<MemPoolCollection>,
    segment_id: SegmentId,
}

impl PoolSet {
    pub(crate) fn new(pools: Arc<MemPoolCollection>, segment_id: SegmentId) -> Self {
        Self { pools, segment_id }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Rebuilds a [`SharedChunk`] handle from a relative offset previously obtained from
    /// [`SharedChunk::relative_offset()`], without touching its reference count. Used by the
    /// port layer to turn an offset popped off a receive queue, or swept out of a
    /// [`crate::port::used_chunk_list::UsedChunkList`], back into an owned handle representing
    /// the share that offset stood for.
    ///
    /// # Safety
    /// `offset` must have been produced by a chunk allocated from this same pool set, and must
    /// represent a share this caller is entitled to take ownership of exactly once.
    pub(crate) unsafe fn reconstruct(
        &self,
        offset: chunkbus_cal::shm_allocator::PointerOffset,
    ) -> SharedChunk {
        let base = self.pools.segment_base_address();
        let ptr = (base + offset.offset() as usize) as *mut ChunkHeader;
        SharedChunk::new(
            unsafe { NonNull::new_unchecked(ptr) },
            Arc::clone(&self.pools),
            self.segment_id,
        )
    }

    pub fn pool_count(&self) -> usize {
        self.pools.pool_count()
    }

    pub fn used(&self) -> usize {
        self.pools.used()
    }

    /// Allocates a chunk sized to fit `payload_size`/`payload_align`, with an optional
    /// user-header of `user_header_size`/`user_header_align` placed between the chunk header and
    /// the payload.
    pub fn allocate(
        &self,
        payload_size: usize,
        payload_align: usize,
        user_header_size: usize,
        user_header_align: usize,
    ) -> Result<SharedChunk, AllocError> {
        let (header, _layout) = self.pools.allocate(
            payload_size,
            payload_align,
            user_header_size,
            user_header_align,
        )?;
        Ok(SharedChunk::new(
            header,
            Arc::clone(&self.pools),
            self.segment_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkbus_bb::testing::assert_that;

    fn collection(entries: &[(usize, usize)]) -> (Vec<u8>, MemPoolCollection) {
        let chunk_region: usize = entries.iter().map(|(size, count)| size * count).sum();
        let mut memory = vec![0u8; chunk_region];
        let base = memory.as_mut_ptr() as usize;
        let config = entries
            .iter()
            .fold(PoolConfig::new(), |c, (size, count)| c.add(*size, *count));
        let collection = unsafe { MemPoolCollection::new(&config, 0, base) };
        (memory, collection)
    }

    #[test]
    fn pools_are_sorted_ascending_by_chunk_size_regardless_of_config_order() {
        let (_mem, collection) = collection(&[(512, 2), (128, 4), (256, 4)]);
        assert_that!(collection.pool(0).unwrap().chunk_size(), eq 128);
        assert_that!(collection.pool(1).unwrap().chunk_size(), eq 256);
        assert_that!(collection.pool(2).unwrap().chunk_size(), eq 512);
    }

    #[test]
    fn allocate_picks_smallest_fitting_pool() {
        let (_mem, collection) = collection(&[(128, 4), (1024, 4)]);
        let pool_set = PoolSet::new(Arc::new(collection), SegmentId::new(0));
        let chunk = pool_set.allocate(64, 8, 0, 0).unwrap();
        assert_that!(chunk.chunk_size(), eq 128);
    }

    #[test]
    fn allocate_fails_with_payload_too_large_when_no_pool_fits() {
        let (_mem, collection) = collection(&[(128, 4)]);
        let pool_set = PoolSet::new(Arc::new(collection), SegmentId::new(0));
        assert_that!(
            pool_set.allocate(4096, 8, 0, 0),
            eq Err(AllocError::PayloadTooLarge)
        );
    }

    #[test]
    fn allocate_fails_with_running_out_of_chunks_when_fitting_pool_is_exhausted() {
        let (_mem, collection) = collection(&[(128, 1)]);
        let pool_set = PoolSet::new(Arc::new(collection), SegmentId::new(0));
        let _first = pool_set.allocate(32, 8, 0, 0).unwrap();
        assert_that!(
            pool_set.allocate(32, 8, 0, 0),
            eq Err(AllocError::RunningOutOfChunks)
        );
    }

    #[test]
    fn dropping_the_last_shared_chunk_returns_it_to_the_pool() {
        let (_mem, collection) = collection(&[(128, 1)]);
        let pool_set = PoolSet::new(Arc::new(collection), SegmentId::new(0));
        let chunk = pool_set.allocate(32, 8, 0, 0).unwrap();
        assert_that!(pool_set.used(), eq 1);
        drop(chunk);
        assert_that!(pool_set.used(), eq 0);
    }
}

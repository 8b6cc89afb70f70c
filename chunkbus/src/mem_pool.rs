// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A fixed-capacity array of equally-sized chunks with an O(1) lock-free
//! freelist. One [`MemPool`] exists per configured chunk size inside a
//! segment's [`MemPoolCollection`](crate::mem_pool_collection::MemPoolCollection).

use crate::chunk_header::ChunkHeader;
use crate::chunk_layout::ChunkLayout;
use chunkbus_cal::shm_allocator::pool_allocator::{Config, PoolAllocator};
use chunkbus_cal::shm_allocator::{PointerOffset, ShmAllocationError, ShmAllocator};
use chunkbus_pal::iox_atomic::IoxAtomicUsize;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum MemPoolAllocError {
    RunningOutOfChunks,
}

/// One bucket size's worth of chunk memory, carved out of a segment's payload region.
#[derive(Debug)]
pub struct MemPool {
    allocator: PoolAllocator,
    chunk_size: usize,
    chunk_count: usize,
    /// Absolute address (in this process) that chunk offsets inside this pool are relative to —
    /// the segment's mapped base address.
    segment_base_address: usize,
    min_free: IoxAtomicUsize,
}

impl MemPool {
    fn bucket_layout(chunk_size: usize) -> Layout {
        Layout::from_size_align(chunk_size, core::mem::align_of::<ChunkHeader>())
            .expect("chunk size for a configured pool is always a valid layout")
    }

    /// # Safety
    /// `segment_base_address + relative_base_offset` must address at least
    /// `chunk_size * chunk_count` bytes, owned exclusively by this pool for its lifetime.
    pub(crate) unsafe fn new(
        chunk_size: usize,
        chunk_count: usize,
        relative_base_offset: usize,
        segment_base_address: usize,
    ) -> Self {
        let config = Config {
            bucket_layout: Self::bucket_layout(chunk_size),
        };
        let allocator = unsafe {
            PoolAllocator::new(chunk_count * chunk_size, &config, relative_base_offset)
        };

        Self {
            allocator,
            chunk_size,
            chunk_count,
            segment_base_address,
            min_free: IoxAtomicUsize::new(chunk_count),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Absolute address, in this process, that chunk offsets inside this pool are relative to.
    pub(crate) fn segment_base_address(&self) -> usize {
        self.segment_base_address
    }

    pub fn used(&self) -> usize {
        self.allocator.used()
    }

    /// Smallest number of free chunks ever observed since this pool was created.
    pub fn min_free(&self) -> usize {
        self.min_free.load(Ordering::Relaxed)
    }

    fn update_min_free(&self) {
        let free = self.chunk_count - self.used();
        self.min_free.fetch_min(free, Ordering::Relaxed);
    }

    /// Carves out one bucket and constructs a [`ChunkHeader`] in place with ref-count 1.
    pub(crate) fn allocate(
        &self,
        pool_id: u32,
        layout: &ChunkLayout,
    ) -> Result<NonNull<ChunkHeader>, MemPoolAllocError> {
        let bucket_layout = Self::bucket_layout(self.chunk_size);
        let offset = unsafe { self.allocator.allocate(bucket_layout) }.map_err(|e| match e {
            ShmAllocationError::OutOfMemory => MemPoolAllocError::RunningOutOfChunks,
            _ => MemPoolAllocError::RunningOutOfChunks,
        })?;
        self.update_min_free();

        let ptr = (self.segment_base_address + offset.offset() as usize) as *mut ChunkHeader;
        unsafe { ptr.write(ChunkHeader::new(self.chunk_size, pool_id, layout)) };
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// # Safety
    /// `header` must have been returned by [`MemPool::allocate()`] on this same pool and not
    /// already released.
    pub(crate) unsafe fn release(&self, header: NonNull<ChunkHeader>) {
        let relative = header.as_ptr() as usize - self.segment_base_address;
        let offset = PointerOffset::new(relative);
        let bucket_layout = Self::bucket_layout(self.chunk_size);
        unsafe { self.allocator.deallocate(offset, bucket_layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_layout;
    use chunkbus_bb::testing::assert_that;

    fn layout_for(payload_size: usize) -> ChunkLayout {
        chunk_layout::compute(
            core::mem::size_of::<ChunkHeader>(),
            core::mem::align_of::<ChunkHeader>(),
            payload_size,
            8,
            0,
            0,
        )
    }

    #[test]
    fn allocate_then_release_returns_chunk_to_pool() {
        const CHUNK_SIZE: usize = 256;
        const CHUNK_COUNT: usize = 4;
        let mut memory = vec![0u8; CHUNK_SIZE * CHUNK_COUNT];
        let base = memory.as_mut_ptr() as usize;

        let pool = unsafe { MemPool::new(CHUNK_SIZE, CHUNK_COUNT, 0, base) };
        let layout = layout_for(64);

        let header = pool.allocate(0, &layout).unwrap();
        assert_that!(pool.used(), eq 1);
        unsafe { pool.release(header) };
        assert_that!(pool.used(), eq 0);
    }

    #[test]
    fn allocate_fails_with_running_out_of_chunks_when_pool_exhausted() {
        const CHUNK_SIZE: usize = 128;
        const CHUNK_COUNT: usize = 2;
        let mut memory = vec![0u8; CHUNK_SIZE * CHUNK_COUNT];
        let base = memory.as_mut_ptr() as usize;
        let pool = unsafe { MemPool::new(CHUNK_SIZE, CHUNK_COUNT, 0, base) };
        let layout = layout_for(32);

        let _a = pool.allocate(0, &layout).unwrap();
        let _b = pool.allocate(0, &layout).unwrap();
        assert_that!(
            pool.allocate(0, &layout),
            eq Err(MemPoolAllocError::RunningOutOfChunks)
        );
    }

    #[test]
    fn min_free_tracks_the_lowest_observed_free_count() {
        const CHUNK_SIZE: usize = 128;
        const CHUNK_COUNT: usize = 4;
        let mut memory = vec![0u8; CHUNK_SIZE * CHUNK_COUNT];
        let base = memory.as_mut_ptr() as usize;
        let pool = unsafe { MemPool::new(CHUNK_SIZE, CHUNK_COUNT, 0, base) };
        let layout = layout_for(32);

        let a = pool.allocate(0, &layout).unwrap();
        let b = pool.allocate(0, &layout).unwrap();
        assert_that!(pool.min_free(), eq 2);
        unsafe { pool.release(a) };
        unsafe { pool.release(b) };
        assert_that!(pool.min_free(), eq 2);
    }
}

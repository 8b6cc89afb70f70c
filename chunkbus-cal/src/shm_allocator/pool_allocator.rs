// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A single-bucket-size allocator: every allocation consumes exactly one
//! bucket of `config.bucket_layout`, handed out from a lock-free freelist.
//! This is the allocator behind each individual `MemPool` inside a
//! `MemPoolCollection` — a collection configures several of these, one per
//! registered bucket size, and picks the smallest one that fits an
//! incoming request.
//!
//! The freelist bookkeeping (the [`UniqueIndexSet`]) is process-local: it
//! tracks which buckets are free, and every process in the IPC group
//! builds and owns its own copy from the bucket count alone, so it never
//! needs to live inside the mapped segment itself. Only bucket *offsets*
//! — communicated as [`PointerOffset`] — must agree across processes, and
//! those are always computed from the externally supplied payload base
//! address.

use crate::shm_allocator::{PointerOffset, ShmAllocationError, ShmAllocator};
use chunkbus_bb::allocator::BumpAllocator;
use chunkbus_bb::lock_free::unique_index_set::{ReleaseMode, UniqueIndexSet};
use chunkbus_bb::relocatable_container::RelocatableContainer;
use core::alloc::Layout;

/// Fixed configuration of a single [`PoolAllocator`]: the size and
/// alignment of every bucket it hands out.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub bucket_layout: Layout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_layout: Layout::new::<u8>(),
        }
    }
}

#[derive(Debug)]
pub struct PoolAllocator {
    base_address: usize,
    bucket_layout: Layout,
    number_of_buckets: usize,
    freelist_management_memory: Box<[u8]>,
    free_indices: UniqueIndexSet,
}

// `freelist_management_memory` is never accessed through `&self` after
// construction; `free_indices` only ever reads/writes it via the raw
// pointer handed to it at `init` time, which stays valid for the lifetime
// of this struct since the `Box` is never moved out of it.
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
    pub fn bucket_size(&self) -> usize {
        self.bucket_layout.size()
    }

    pub fn number_of_buckets(&self) -> usize {
        self.number_of_buckets
    }

    /// Number of buckets currently handed out and not yet deallocated.
    pub fn used(&self) -> usize {
        self.free_indices.borrowed_indices()
    }
}

impl ShmAllocator for PoolAllocator {
    type Configuration = Config;

    fn management_size(value: usize, config: &Self::Configuration) -> usize {
        let bucket_size = config.bucket_layout.size().max(1);
        let number_of_buckets = value / bucket_size;
        UniqueIndexSet::const_memory_size(number_of_buckets)
    }

    unsafe fn new(
        max_supported_alignment_by_memory: usize,
        config: &Self::Configuration,
        base_address: usize,
    ) -> Self {
        let bucket_size = config.bucket_layout.size().max(1);
        let number_of_buckets = max_supported_alignment_by_memory / bucket_size;

        let mut freelist_management_memory =
            vec![0u8; UniqueIndexSet::const_memory_size(number_of_buckets)].into_boxed_slice();
        let bump = BumpAllocator::new(
            core::ptr::NonNull::new(freelist_management_memory.as_mut_ptr())
                .expect("boxed slice pointer is never null"),
            freelist_management_memory.len(),
        );

        let free_indices = UniqueIndexSet::new_uninit(number_of_buckets);
        free_indices
            .init(&bump)
            .expect("freelist management memory was sized to exactly fit the freelist");

        Self {
            base_address,
            bucket_layout: config.bucket_layout,
            number_of_buckets,
            freelist_management_memory,
            free_indices,
        }
    }

    unsafe fn allocate(&self, layout: Layout) -> Result<PointerOffset, ShmAllocationError> {
        if layout.size() > self.bucket_layout.size() {
            return Err(ShmAllocationError::SizeTooLarge);
        }
        if layout.align() > self.bucket_layout.align() {
            return Err(ShmAllocationError::AlignmentFailure);
        }

        let index = self
            .free_indices
            .acquire_raw_index()
            .ok_or(ShmAllocationError::OutOfMemory)?;

        Ok(PointerOffset::new(
            self.base_address + index as usize * self.bucket_layout.size(),
        ))
    }

    unsafe fn deallocate(&self, offset: PointerOffset, _layout: Layout) {
        let relative = offset.offset() as usize - self.base_address;
        let index = (relative / self.bucket_layout.size()) as u32;
        self.free_indices.release_raw_index(index, ReleaseMode::Default);
    }

    fn usable_size(&self) -> usize {
        self.number_of_buckets * self.bucket_layout.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkbus_bb::testing::assert_that;

    #[test]
    fn allocate_and_deallocate_single_bucket() {
        const BUCKET_SIZE: usize = 128;
        const NUM_BUCKETS: usize = 4;
        let bucket_layout = Layout::from_size_align(BUCKET_SIZE, 8).unwrap();
        let config = Config { bucket_layout };

        let mut memory = vec![0u8; NUM_BUCKETS * BUCKET_SIZE];
        let base = memory.as_mut_ptr() as usize;

        let sut = unsafe { PoolAllocator::new(NUM_BUCKETS * BUCKET_SIZE, &config, base) };
        assert_that!(sut.number_of_buckets(), eq NUM_BUCKETS);

        let offset = unsafe { sut.allocate(bucket_layout) }.unwrap();
        unsafe { sut.deallocate(offset, bucket_layout) };

        let mut offsets = Vec::new();
        for _ in 0..NUM_BUCKETS {
            offsets.push(unsafe { sut.allocate(bucket_layout) }.unwrap());
        }
        assert_that!(unsafe { sut.allocate(bucket_layout) }.is_err(), is_true);

        for offset in offsets {
            unsafe { sut.deallocate(offset, bucket_layout) };
        }
    }

    #[test]
    fn allocate_fails_when_requested_size_exceeds_bucket() {
        let bucket_layout = Layout::from_size_align(64, 8).unwrap();
        let config = Config { bucket_layout };
        let mut memory = vec![0u8; 2 * 64];
        let base = memory.as_mut_ptr() as usize;
        let sut = unsafe { PoolAllocator::new(2 * 64, &config, base) };

        let too_large = Layout::from_size_align(128, 8).unwrap();
        assert_that!(unsafe { sut.allocate(too_large) }.is_err(), is_true);
    }
}

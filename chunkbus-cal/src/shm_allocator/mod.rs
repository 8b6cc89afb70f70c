// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Allocators that hand out chunks of a shared memory segment identified by
//! [`PointerOffset`] rather than a raw pointer, so the allocation can be
//! communicated to another process and resolved there.

pub mod pointer_offset;
pub mod pool_allocator;

pub use pointer_offset::{PointerOffset, SegmentId};

use core::alloc::Layout;
use core::fmt::Debug;

/// Failure returned by [`ShmAllocator::allocate()`].
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum ShmAllocationError {
    SizeTooLarge,
    AlignmentFailure,
    OutOfMemory,
    InternalError,
}

/// An allocator whose memory lives in a shared memory segment and whose
/// allocations are addressed via [`PointerOffset`] instead of raw
/// pointers. Implemented by [`pool_allocator::PoolAllocator`]; a memory
/// pool collection selects among several of these, one per configured
/// bucket size.
pub trait ShmAllocator: Debug + Send + Sync {
    type Configuration: Copy + Clone + Debug;

    /// Minimum management memory this allocator requires for a given payload `value` and
    /// configuration, ahead of any allocation.
    fn management_size(value: usize, config: &Self::Configuration) -> usize;

    /// Creates a new allocator managing `max_supported_alignment_by_memory` bytes starting at
    /// `base_address`.
    ///
    /// # Safety
    /// `base_address` must point at memory of at least `management_size()` plus the requested
    /// payload size, owned exclusively by this allocator for its lifetime.
    unsafe fn new(
        max_supported_alignment_by_memory: usize,
        config: &Self::Configuration,
        base_address: usize,
    ) -> Self;

    /// Allocates a chunk. Returns the [`PointerOffset`] identifying it relative to
    /// `base_address`.
    ///
    /// # Safety
    /// Must only be called after initial setup (see implementors for details).
    unsafe fn allocate(&self, layout: Layout) -> Result<PointerOffset, ShmAllocationError>;

    /// Returns a chunk previously returned by [`ShmAllocator::allocate()`] to the allocator.
    ///
    /// # Safety
    /// `offset` and `layout` must match a prior successful [`ShmAllocator::allocate()`] call on
    /// this allocator, and must not be deallocated twice.
    unsafe fn deallocate(&self, offset: PointerOffset, layout: Layout);

    /// The number of bytes usable for one allocation with this allocator's configuration.
    fn usable_size(&self) -> usize;
}

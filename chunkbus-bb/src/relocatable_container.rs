// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Every fixed-capacity data structure placed inside a shared memory
//! segment (the pool allocator's freelist, the used-chunk list) follows
//! the same two-step construction protocol: `new_uninit` produces a value
//! whose relocatable pointers are all zeroed, and a later `init` call
//! — performed by exactly one process, after the backing memory is mapped
//! — computes their distances against an allocator that carves out any
//! auxiliary storage the structure needs (e.g. the backing array for a
//! freelist whose capacity is only known at runtime).

use crate::allocator::{AllocationError, BaseAllocator};

/// A data structure that can be placed in relocatable (shared) memory.
pub trait RelocatableContainer {
    /// # Safety
    /// The returned value is not usable until [`RelocatableContainer::init()`]
    /// has been called on it exactly once.
    unsafe fn new_uninit(capacity: usize) -> Self;

    /// Initializes the container's internal relocatable pointers by
    /// allocating any backing storage from `allocator`.
    ///
    /// # Safety
    /// Must be called exactly once, after the container has been placed at
    /// its final memory address, before any other method is used.
    unsafe fn init<Allocator: BaseAllocator>(
        &self,
        allocator: &Allocator,
    ) -> Result<(), AllocationError>;
}

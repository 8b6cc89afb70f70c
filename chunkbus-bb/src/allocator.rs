// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Allocator traits shared by every memory source in this workspace: the
//! heap (for process-local bookkeeping), a bump allocator (for
//! administrative shared-memory segments), and the pool allocator (for
//! chunk payload memory).

use crate::fail;
use crate::math::align;
use chunkbus_pal::iox_atomic::IoxAtomicUsize;
use core::fmt::Display;
pub use core::{alloc::Layout, ptr::NonNull};
use core::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum AllocationError {
    SizeIsZero,
    SizeTooLarge,
    AlignmentFailure,
    OutOfMemory,
    InternalError,
}

/// The most basic requirement an allocator must satisfy.
pub trait BaseAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocationError>;

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocationError> {
        let memory = self.allocate(layout)?;
        unsafe {
            core::ptr::write_bytes(memory.as_ref().as_ptr() as *mut u8, 0, memory.as_ref().len())
        };
        Ok(memory)
    }

    /// # Safety
    /// `ptr` must have been allocated by this same allocator with the same layout.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A threadsafe, lock-free bump allocator. Used to carve the fixed-size
/// administrative structures (segment manager, mem pool collection
/// headers, used-chunk lists) out of the management portion of a shared
/// memory segment during its one-time setup. It never frees individual
/// allocations — only the whole region at once.
#[derive(Debug)]
pub struct BumpAllocator {
    start: usize,
    size: usize,
    current_position: IoxAtomicUsize,
}

impl Display for BumpAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "BumpAllocator {{ start: {}, size: {}, used: {} }}",
            self.start,
            self.size,
            self.current_position.load(Ordering::Relaxed)
        )
    }
}

impl BumpAllocator {
    pub fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            start: ptr.as_ptr() as usize,
            size,
            current_position: IoxAtomicUsize::new(0),
        }
    }

    pub fn start_address(&self) -> usize {
        self.start
    }

    pub fn used_space(&self) -> usize {
        self.current_position.load(Ordering::Relaxed)
    }

    pub fn free_space(&self) -> usize {
        self.size - self.used_space()
    }

    pub fn total_space(&self) -> usize {
        self.size
    }
}

impl BaseAllocator for BumpAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocationError> {
        let msg = "Unable to allocate chunk";
        if layout.size() == 0 {
            fail!(from self, with AllocationError::SizeIsZero,
                "{} with {:?} since the requested size was zero.", msg, layout);
        }

        let mut current_position = self.current_position.load(Ordering::Relaxed);
        let mut aligned_position;
        loop {
            aligned_position = align(self.start + current_position, layout.align()) - self.start;
            if aligned_position + layout.size() > self.size {
                fail!(from self, with AllocationError::OutOfMemory,
                    "{} with {:?} since there is not enough memory available.", msg, layout);
            }

            match self.current_position.compare_exchange_weak(
                current_position,
                aligned_position + layout.size(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => current_position = v,
            }
        }

        Ok(unsafe {
            NonNull::new_unchecked(core::slice::from_raw_parts_mut(
                (self.start + aligned_position) as *mut u8,
                layout.size(),
            ))
        })
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        self.current_position.store(0, Ordering::Relaxed);
    }
}

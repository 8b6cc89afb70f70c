// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A **threadsafe** and **lock-free** set of indices. Used as the bucket
//! freelist for the pool allocator and the slot freelist for the
//! used-chunk list. When created it is filled with every index in
//! `0..capacity`; indices are acquired and returned in O(1) via a single
//! CAS loop, with no per-index locking.
//!
//! # Example
//!
//! ```
//! use chunkbus_bb::lock_free::unique_index_set::FixedSizeUniqueIndexSet;
//!
//! let index_set = FixedSizeUniqueIndexSet::<128>::new();
//!
//! let new_index = match index_set.acquire() {
//!     None => panic!("Out of indices"),
//!     Some(i) => i,
//! };
//!
//! println!("Acquired index {}", new_index.value());
//! drop(new_index);
//! ```

use crate::allocator::{AllocationError, BaseAllocator};
use crate::math::align_to;
use crate::relocatable_container::RelocatableContainer;
use crate::relocatable_ptr::{PointerTrait, RelocatablePointer};
use crate::{fail, fatal_panic};
use chunkbus_pal::iox_atomic::{IoxAtomicBool, IoxAtomicU64};
use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::sync::atomic::{fence, Ordering};
use std::alloc::Layout;
use tiny_fn::tiny_fn;

tiny_fn! {
    pub struct CleanupCallback = Fn(index: u32);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UniqueIndexCreationError {
    ProvidedCapacityGreaterThanMaxCapacity,
    ProvidedCapacityIsZero,
}

/// Describes whether indices can still be acquired after a call to
/// [`UniqueIndexSet::release_raw_index()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReleaseMode {
    /// Locks the set for further acquisition if the released index was the last one.
    LockIfLastIndex,
    /// Indices can still be acquired after the release.
    Default,
}

/// RAII guard for an acquired index. Returns the index to its originating
/// [`UniqueIndexSet`] when dropped.
pub struct UniqueIndex<'a> {
    value: u32,
    index_set: &'a UniqueIndexSet,
    cleanup_callback: Option<CleanupCallback<'a>>,
}

impl Debug for UniqueIndex<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "UniqueIndex {{ value: {}, index_set addr: {:#x} }}",
            self.value,
            core::ptr::addr_of!(self.index_set) as u64
        )
    }
}

impl UniqueIndex<'_> {
    pub fn value(&self) -> u32 {
        self.value
    }
}

impl Drop for UniqueIndex<'_> {
    fn drop(&mut self) {
        if let Some(cb) = self.cleanup_callback.as_ref() {
            cb.call(self.value);
        }
        unsafe {
            self.index_set
                .release_raw_index(self.value, ReleaseMode::Default)
        };
    }
}

const LOCK_ACQUIRE: u32 = 0x00ffffff;

struct HeadDetails {
    head: u32,
    aba: u16,
    borrowed_indices: u32,
}

impl HeadDetails {
    fn from(value: u64) -> Self {
        Self {
            head: ((value & 0xffffff0000000000) >> 40) as u32,
            aba: ((value & 0x000000ffff000000) >> 24) as u16,
            borrowed_indices: (value & 0x0000000000ffffff) as u32,
        }
    }

    fn value(&self) -> u64 {
        (((self.head & 0x00ffffff) as u64) << 40)
            | (self.aba as u64) << 24
            | ((self.borrowed_indices & 0x00ffffff) as u64)
    }
}

/// A **non-movable** set of unique indices with a runtime-fixed capacity.
/// The compile-time-sized variant is [`FixedSizeUniqueIndexSet`].
#[repr(C)]
#[derive(Debug)]
pub struct UniqueIndexSet {
    data_ptr: RelocatablePointer<UnsafeCell<u32>>,
    capacity: u32,
    pub(crate) head: IoxAtomicU64,
    is_memory_initialized: IoxAtomicBool,
}

unsafe impl Sync for UniqueIndexSet {}
unsafe impl Send for UniqueIndexSet {}

impl UniqueIndexSet {
    /// Places a [`UniqueIndexSet`] at a fixed distance from an already
    /// allocated backing array, skipping the allocator-based `init` step.
    /// Used by [`FixedSizeUniqueIndexSet`], whose backing array is an
    /// ordinary struct field laid out right after this header.
    ///
    /// # Safety
    /// `distance_to_data` must point at `capacity + 1` contiguous,
    /// already-initialized `UnsafeCell<u32>` freelist links.
    pub(crate) unsafe fn new(capacity: usize, distance_to_data: isize) -> Self {
        Self {
            data_ptr: RelocatablePointer::new(distance_to_data),
            capacity: capacity as u32,
            head: IoxAtomicU64::new(0),
            is_memory_initialized: IoxAtomicBool::new(true),
        }
    }

    #[inline(always)]
    fn verify_init(&self, source: &str) {
        debug_assert!(
            self.is_memory_initialized.load(Ordering::Relaxed),
            "Undefined behavior when calling \"{}\" and the object is not initialized.",
            source
        );
    }

    /// The compile-time version of [`RelocatableContainer::memory_size()`].
    pub const fn const_memory_size(capacity: usize) -> usize {
        core::mem::size_of::<UnsafeCell<u32>>() * (capacity + 1) + core::mem::align_of::<u32>() - 1
    }

    /// Acquires a new [`UniqueIndex`], or `None` if the set is exhausted.
    ///
    /// # Safety
    /// The set must have been created with [`UniqueIndexSet::new()`] or initialized with
    /// [`RelocatableContainer::init()`].
    pub unsafe fn acquire(&self) -> Option<UniqueIndex<'_>> {
        self.verify_init("acquire");
        self.acquire_raw_index().map(|v| UniqueIndex {
            value: v,
            index_set: self,
            cleanup_callback: None,
        })
    }

    /// Like [`UniqueIndexSet::acquire()`] but runs `cleanup_callback` once, with the index
    /// value, when the returned guard is dropped and the index is released.
    ///
    /// # Safety
    /// See [`UniqueIndexSet::acquire()`].
    pub unsafe fn acquire_with_additional_cleanup<'a, F: Fn(u32) + 'a>(
        &'a self,
        cleanup_callback: F,
    ) -> Option<UniqueIndex<'a>> {
        self.verify_init("acquire_with_additional_cleanup");
        self.acquire_raw_index().map(|v| UniqueIndex {
            value: v,
            index_set: self,
            cleanup_callback: Some(CleanupCallback::new(cleanup_callback)),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn borrowed_indices(&self) -> usize {
        HeadDetails::from(self.head.load(Ordering::Relaxed)).borrowed_indices as usize
    }

    /// Acquires a raw index. The caller is responsible for returning it with
    /// [`UniqueIndexSet::release_raw_index()`]; otherwise the index is leaked.
    ///
    /// # Safety
    /// The set must have been created with [`UniqueIndexSet::new()`] or initialized with
    /// [`RelocatableContainer::init()`].
    pub unsafe fn acquire_raw_index(&self) -> Option<u32> {
        self.verify_init("acquire_raw_index");
        let mut old_value = self.head.load(Ordering::Acquire);
        let mut old = HeadDetails::from(old_value);

        loop {
            if old.head >= self.capacity || old.borrowed_indices == LOCK_ACQUIRE {
                return None;
            }

            let new_value = HeadDetails {
                head: *self.get_next_free_index(old.head),
                aba: old.aba.wrapping_add(1),
                borrowed_indices: old.borrowed_indices + 1,
            }
            .value();

            old = match self.head.compare_exchange(
                old_value,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(v) => {
                    old_value = v;
                    HeadDetails::from(v)
                }
            }
        }

        let index = old.head;
        *self.get_next_free_index(index) = self.capacity + 1;

        fence(Ordering::Acquire);
        Some(index)
    }

    /// Releases a raw index acquired via [`UniqueIndexSet::acquire_raw_index()`].
    ///
    /// # Safety
    /// The index must have been acquired from this set and not already released.
    pub unsafe fn release_raw_index(&self, index: u32, mode: ReleaseMode) {
        self.verify_init("release_raw_index");
        fence(Ordering::Release);

        let mut old_value = self.head.load(Ordering::Acquire);
        let mut old = HeadDetails::from(old_value);

        loop {
            *self.get_next_free_index(index) = old.head;

            let borrowed_indices = if mode == ReleaseMode::LockIfLastIndex && old.borrowed_indices == 1
            {
                LOCK_ACQUIRE
            } else {
                old.borrowed_indices - 1
            };

            let new_value = HeadDetails {
                head: index,
                aba: old.aba.wrapping_add(1),
                borrowed_indices,
            }
            .value();

            old = match self.head.compare_exchange(
                old_value,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(v) => {
                    old_value = v;
                    HeadDetails::from(v)
                }
            };
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_next_free_index(&self, index: u32) -> &mut u32 {
        unsafe { &mut *(*self.data_ptr.as_ptr().offset(index as isize)).get() }
    }
}

impl RelocatableContainer for UniqueIndexSet {
    unsafe fn new_uninit(capacity: usize) -> Self {
        debug_assert!(
            capacity < 2usize.pow(24) - 1,
            "The provided capacity exceeds the maximum supported capacity of the UniqueIndexSet"
        );

        Self {
            data_ptr: RelocatablePointer::new_uninit(),
            capacity: capacity as u32,
            head: IoxAtomicU64::new(0),
            is_memory_initialized: IoxAtomicBool::new(false),
        }
    }

    unsafe fn init<T: BaseAllocator>(&self, allocator: &T) -> Result<(), AllocationError> {
        if self.is_memory_initialized.load(Ordering::Relaxed) {
            fatal_panic!(from self,
                "Memory already initialized. Initializing it twice may lead to undefined behavior.");
        }

        let memory = fail!(from self, when allocator
            .allocate(Layout::from_size_align_unchecked(
                core::mem::size_of::<u32>() * (self.capacity + 1) as usize,
                core::mem::align_of::<u32>())),
            "Failed to initialize since the allocation of the data memory failed."
        );
        self.data_ptr.init(memory);

        for i in 0..self.capacity + 1 {
            (self.data_ptr.as_ptr() as *mut UnsafeCell<u32>)
                .offset(i as isize)
                .write(UnsafeCell::new(i + 1));
        }

        self.is_memory_initialized.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// The compile-time fixed size version of [`UniqueIndexSet`].
///
/// ```
/// use chunkbus_bb::lock_free::unique_index_set::FixedSizeUniqueIndexSet;
///
/// let index_set = FixedSizeUniqueIndexSet::<128>::new();
/// let new_index = index_set.acquire().expect("out of indices");
/// ```
#[derive(Debug)]
#[repr(C)]
pub struct FixedSizeUniqueIndexSet<const CAPACITY: usize> {
    pub(crate) state: UniqueIndexSet,
    next_free_index: [UnsafeCell<u32>; CAPACITY],
    next_free_index_plus_one: UnsafeCell<u32>,
}

impl<const CAPACITY: usize> Default for FixedSizeUniqueIndexSet<CAPACITY> {
    fn default() -> Self {
        Self {
            state: unsafe {
                UniqueIndexSet::new(
                    CAPACITY,
                    align_to::<UnsafeCell<u32>>(core::mem::size_of::<UniqueIndexSet>()) as isize,
                )
            },
            next_free_index: core::array::from_fn(|i| UnsafeCell::new(i as u32 + 1)),
            next_free_index_plus_one: UnsafeCell::new(CAPACITY as u32 + 1),
        }
    }
}

unsafe impl<const CAPACITY: usize> Sync for FixedSizeUniqueIndexSet<CAPACITY> {}
unsafe impl<const CAPACITY: usize> Send for FixedSizeUniqueIndexSet<CAPACITY> {}

impl<const CAPACITY: usize> FixedSizeUniqueIndexSet<CAPACITY> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set with a capacity smaller than `CAPACITY`. Fails if `capacity` is zero or
    /// exceeds `CAPACITY`.
    pub fn new_with_reduced_capacity(capacity: usize) -> Result<Self, UniqueIndexCreationError> {
        if capacity > CAPACITY {
            fail!(from "FixedSizeUniqueIndexSet::new_with_reduced_capacity",
                with UniqueIndexCreationError::ProvidedCapacityGreaterThanMaxCapacity,
                "Provided value of capacity {} exceeds maximum supported capacity of {}.",
                capacity, CAPACITY);
        }

        if capacity == 0 {
            fail!(from "FixedSizeUniqueIndexSet::new_with_reduced_capacity",
                with UniqueIndexCreationError::ProvidedCapacityIsZero,
                "Provided value of capacity is zero.");
        }

        Ok(Self {
            state: unsafe {
                UniqueIndexSet::new(
                    capacity,
                    align_to::<UnsafeCell<u32>>(core::mem::size_of::<UniqueIndexSet>()) as isize,
                )
            },
            next_free_index: core::array::from_fn(|i| UnsafeCell::new(i as u32 + 1)),
            next_free_index_plus_one: UnsafeCell::new(capacity as u32 + 1),
        })
    }

    pub fn acquire(&self) -> Option<UniqueIndex<'_>> {
        unsafe { self.state.acquire() }
    }

    pub fn acquire_with_additional_cleanup<'a, F: Fn(u32) + 'a>(
        &'a self,
        cleanup_callback: F,
    ) -> Option<UniqueIndex<'a>> {
        unsafe { self.state.acquire_with_additional_cleanup(cleanup_callback) }
    }

    pub fn capacity(&self) -> u32 {
        self.state.capacity()
    }

    /// # Safety
    /// The acquired index must be returned with [`FixedSizeUniqueIndexSet::release_raw_index()`].
    pub unsafe fn acquire_raw_index(&self) -> Option<u32> {
        self.state.acquire_raw_index()
    }

    /// # Safety
    /// The index must have been acquired with [`FixedSizeUniqueIndexSet::acquire_raw_index()`]
    /// and must not be released twice.
    pub unsafe fn release_raw_index(&self, index: u32, mode: ReleaseMode) {
        self.state.release_raw_index(index, mode)
    }

    pub fn borrowed_indices(&self) -> usize {
        self.state.borrowed_indices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_that;

    #[test]
    fn head_details_roundtrips_through_packed_u64() {
        let sut_value = HeadDetails {
            head: 12345,
            aba: 6789,
            borrowed_indices: 54321,
        }
        .value();

        let sut = HeadDetails::from(sut_value);

        assert_that!(sut.head, eq 12345);
        assert_that!(sut.aba, eq 6789);
        assert_that!(sut.borrowed_indices, eq 54321);
    }

    #[test]
    fn acquire_exhausts_capacity_then_returns_none() {
        let set = FixedSizeUniqueIndexSet::<4>::new();
        let mut indices = Vec::new();
        for _ in 0..4 {
            indices.push(set.acquire().expect("should have capacity"));
        }
        assert_that!(set.acquire().is_none(), is_true);
    }

    #[test]
    fn released_index_can_be_reacquired() {
        let set = FixedSizeUniqueIndexSet::<2>::new();
        let first = set.acquire().unwrap();
        let value = first.value();
        drop(first);
        let second = set.acquire().unwrap();
        assert_that!(second.value(), eq value);
    }

    #[test]
    fn cleanup_callback_runs_on_release() {
        use core::sync::atomic::{AtomicU32, Ordering as O};
        let set = FixedSizeUniqueIndexSet::<2>::new();
        let observed = AtomicU32::new(u32::MAX);
        let index = set
            .acquire_with_additional_cleanup(|v| observed.store(v, O::Relaxed))
            .unwrap();
        let value = index.value();
        drop(index);
        assert_that!(observed.load(O::Relaxed), eq value);
    }
}

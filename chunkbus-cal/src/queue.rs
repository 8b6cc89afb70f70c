// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A threadsafe, lock-free single-producer single-consumer queue of
//! [`PointerOffset`]s, encoded as raw `u64`s. This is the receive queue a
//! publisher's `send` enqueues into and a subscriber's `take` dequeues
//! from; one instance is owned per publisher/subscriber connection, which
//! is why SPSC (rather than MPMC) is sufficient.
//!
//! When full, [`details::ChunkQueue::push()`] overwrites the oldest entry
//! and hands it back to the caller — this is the `DISCARD_OLDEST_DATA`
//! queue-full policy. `BLOCK_PRODUCER` is implemented by the port layer
//! spinning on [`details::ChunkQueue::is_full()`] before calling `push`,
//! since this queue itself never blocks.

use chunkbus_bb::allocator::{AllocationError, BaseAllocator};
use chunkbus_bb::math::unaligned_mem_size;
use chunkbus_bb::relocatable_container::RelocatableContainer;
use chunkbus_bb::relocatable_ptr::{OwningPointer, PointerTrait, RelocatablePointer};
use chunkbus_bb::{fail, fatal_panic};
use chunkbus_pal::iox_atomic::{IoxAtomicBool, IoxAtomicU64};
use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::sync::atomic::Ordering;

#[derive(Debug)]
pub struct Producer<'a, PointerType: PointerTrait<UnsafeCell<u64>>> {
    queue: &'a details::ChunkQueue<PointerType>,
}

impl<PointerType: PointerTrait<UnsafeCell<u64>> + Debug> Producer<'_, PointerType> {
    /// Enqueues `value`. Returns the evicted value if the queue was full.
    pub fn push(&mut self, value: u64) -> Option<u64> {
        unsafe { self.queue.push(value) }
    }
}

impl<PointerType: PointerTrait<UnsafeCell<u64>>> Drop for Producer<'_, PointerType> {
    fn drop(&mut self) {
        self.queue.has_producer.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct Consumer<'a, PointerType: PointerTrait<UnsafeCell<u64>>> {
    queue: &'a details::ChunkQueue<PointerType>,
}

impl<PointerType: PointerTrait<UnsafeCell<u64>> + Debug> Consumer<'_, PointerType> {
    pub fn pop(&mut self) -> Option<u64> {
        unsafe { self.queue.pop() }
    }
}

impl<PointerType: PointerTrait<UnsafeCell<u64>>> Drop for Consumer<'_, PointerType> {
    fn drop(&mut self) {
        self.queue.has_consumer.store(true, Ordering::Relaxed);
    }
}

/// Non-relocatable, heap-backed queue for single-process use and tests.
pub type ChunkQueue = details::ChunkQueue<OwningPointer<UnsafeCell<u64>>>;

/// Relocatable variant for placement in shared memory.
pub type RelocatableChunkQueue = details::ChunkQueue<RelocatablePointer<UnsafeCell<u64>>>;

pub mod details {
    use super::*;

    #[derive(Debug)]
    #[repr(C)]
    pub struct ChunkQueue<PointerType: PointerTrait<UnsafeCell<u64>>> {
        data_ptr: PointerType,
        capacity: usize,
        write_position: IoxAtomicU64,
        read_position: IoxAtomicU64,
        pub(super) has_producer: IoxAtomicBool,
        pub(super) has_consumer: IoxAtomicBool,
        is_memory_initialized: IoxAtomicBool,
    }

    unsafe impl<PointerType: PointerTrait<UnsafeCell<u64>>> Sync for ChunkQueue<PointerType> {}
    unsafe impl<PointerType: PointerTrait<UnsafeCell<u64>>> Send for ChunkQueue<PointerType> {}

    impl ChunkQueue<OwningPointer<UnsafeCell<u64>>> {
        pub fn new(capacity: usize) -> Self {
            let mut data_ptr = OwningPointer::<UnsafeCell<u64>>::new_with_alloc(capacity + 1);
            for i in 0..capacity + 1 {
                unsafe { data_ptr.as_mut_ptr().add(i).write(UnsafeCell::new(0)) };
            }

            Self {
                data_ptr,
                capacity,
                write_position: IoxAtomicU64::new(0),
                read_position: IoxAtomicU64::new(0),
                has_producer: IoxAtomicBool::new(true),
                has_consumer: IoxAtomicBool::new(true),
                is_memory_initialized: IoxAtomicBool::new(true),
            }
        }
    }

    impl RelocatableContainer for ChunkQueue<RelocatablePointer<UnsafeCell<u64>>> {
        unsafe fn new_uninit(capacity: usize) -> Self {
            Self {
                data_ptr: RelocatablePointer::new_uninit(),
                capacity,
                write_position: IoxAtomicU64::new(0),
                read_position: IoxAtomicU64::new(0),
                has_producer: IoxAtomicBool::new(true),
                has_consumer: IoxAtomicBool::new(true),
                is_memory_initialized: IoxAtomicBool::new(false),
            }
        }

        unsafe fn init<T: BaseAllocator>(&self, allocator: &T) -> Result<(), AllocationError> {
            if self.is_memory_initialized.load(Ordering::Relaxed) {
                fatal_panic!(from self,
                    "Memory already initialized. Initializing it twice may lead to undefined behavior.");
            }

            let memory = fail!(from self, when allocator
                .allocate(core::alloc::Layout::from_size_align_unchecked(
                    core::mem::size_of::<u64>() * (self.capacity + 1),
                    core::mem::align_of::<u64>())),
                "Failed to initialize since the allocation of the data memory failed."
            );
            self.data_ptr.init(memory);

            for i in 0..self.capacity + 1 {
                (self.data_ptr.as_ptr() as *mut UnsafeCell<u64>)
                    .add(i)
                    .write(UnsafeCell::new(0));
            }

            self.is_memory_initialized.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    impl<PointerType: PointerTrait<UnsafeCell<u64>> + Debug> ChunkQueue<PointerType> {
        #[inline(always)]
        fn verify_init(&self, source: &str) {
            debug_assert!(
                self.is_memory_initialized.load(Ordering::Relaxed),
                "Undefined behavior when calling ChunkQueue::{source} and the object is not initialized."
            );
        }

        pub const fn const_memory_size(capacity: usize) -> usize {
            unaligned_mem_size::<UnsafeCell<u64>>(capacity + 1)
        }

        fn at(&self, position: u64) -> *mut u64 {
            unsafe {
                (*self
                    .data_ptr
                    .as_ptr()
                    .add((position % (self.capacity as u64 + 1)) as usize))
                .get()
            }
        }

        /// Acquires the sole producer handle. `None` if one is already held.
        pub fn acquire_producer(&self) -> Option<Producer<'_, PointerType>> {
            self.verify_init("acquire_producer");
            match self
                .has_producer
                .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => Some(Producer { queue: self }),
                Err(_) => None,
            }
        }

        /// Acquires the sole consumer handle. `None` if one is already held.
        pub fn acquire_consumer(&self) -> Option<Consumer<'_, PointerType>> {
            self.verify_init("acquire_consumer");
            match self
                .has_consumer
                .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => Some(Consumer { queue: self }),
                Err(_) => None,
            }
        }

        /// # Safety
        /// Must not be called concurrently from more than one thread; this is a single-producer
        /// queue, enforced at the API boundary by [`ChunkQueue::acquire_producer()`].
        pub unsafe fn push(&self, value: u64) -> Option<u64> {
            let write_position = self.write_position.load(Ordering::Acquire);
            let read_position = self.read_position.load(Ordering::Relaxed);
            let is_full = write_position == read_position + self.capacity as u64;

            unsafe { self.at(write_position).write(value) };
            self.write_position
                .store(write_position + 1, Ordering::Release);

            if is_full
                && self
                    .read_position
                    .compare_exchange(
                        read_position,
                        read_position + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                Some(unsafe { *self.at(read_position) })
            } else {
                None
            }
        }

        /// # Safety
        /// Must not be called concurrently from more than one thread; see
        /// [`ChunkQueue::acquire_consumer()`].
        pub unsafe fn pop(&self) -> Option<u64> {
            let mut read_position = self.read_position.load(Ordering::Relaxed);
            let is_empty = read_position == self.write_position.load(Ordering::Acquire);
            if is_empty {
                return None;
            }

            let mut value;
            loop {
                value = unsafe { *self.at(read_position) };
                match self.read_position.compare_exchange(
                    read_position,
                    read_position + 1,
                    Ordering::Relaxed,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(v) => read_position = v,
                }
            }
            Some(value)
        }

        fn read_and_write_position(&self) -> (u64, u64) {
            loop {
                let write_position = self.write_position.load(Ordering::Relaxed);
                let read_position = self.read_position.load(Ordering::Relaxed);
                if write_position == self.write_position.load(Ordering::Relaxed)
                    && read_position == self.read_position.load(Ordering::Relaxed)
                {
                    return (write_position, read_position);
                }
            }
        }

        /// Note: may be stale immediately in a concurrent setup; intended for tests and metrics.
        pub fn is_empty(&self) -> bool {
            let (w, r) = self.read_and_write_position();
            w == r
        }

        pub fn len(&self) -> usize {
            let (w, r) = self.read_and_write_position();
            (w - r) as usize
        }

        pub const fn capacity(&self) -> usize {
            self.capacity
        }

        pub fn is_full(&self) -> bool {
            let (w, r) = self.read_and_write_position();
            w == r + self.capacity as u64
        }
    }
}

/// Compile-time fixed-capacity, heap-free variant: backing storage is an ordinary struct field,
/// suitable for embedding directly in a larger shared-memory record.
#[derive(Debug)]
#[repr(C)]
pub struct FixedSizeChunkQueue<const CAPACITY: usize> {
    state: RelocatableChunkQueue,
    data: [UnsafeCell<u64>; CAPACITY],
    data_plus_one: UnsafeCell<u64>,
}

unsafe impl<const CAPACITY: usize> Sync for FixedSizeChunkQueue<CAPACITY> {}
unsafe impl<const CAPACITY: usize> Send for FixedSizeChunkQueue<CAPACITY> {}

impl<const CAPACITY: usize> Default for FixedSizeChunkQueue<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> FixedSizeChunkQueue<CAPACITY> {
    pub fn new() -> Self {
        let mut new_self = Self {
            state: unsafe { RelocatableChunkQueue::new_uninit(CAPACITY) },
            data: core::array::from_fn(|_| UnsafeCell::new(0)),
            data_plus_one: UnsafeCell::new(0),
        };

        let allocator = chunkbus_bb::allocator::BumpAllocator::new(
            core::ptr::NonNull::new(new_self.data.as_mut_ptr().cast())
                .expect("struct field pointer is never null"),
            core::mem::size_of::<u64>() * (CAPACITY + 1),
        );
        unsafe {
            new_self
                .state
                .init(&allocator)
                .expect("all required memory is preallocated")
        };

        new_self
    }

    pub fn acquire_producer(&self) -> Option<Producer<'_, RelocatablePointer<UnsafeCell<u64>>>> {
        self.state.acquire_producer()
    }

    pub fn acquire_consumer(&self) -> Option<Consumer<'_, RelocatablePointer<UnsafeCell<u64>>>> {
        self.state.acquire_consumer()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub const fn capacity(&self) -> usize {
        self.state.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.state.is_full()
    }

    /// # Safety
    /// See [`details::ChunkQueue::push()`].
    pub unsafe fn push(&self, value: u64) -> Option<u64> {
        self.state.push(value)
    }

    /// # Safety
    /// See [`details::ChunkQueue::pop()`].
    pub unsafe fn pop(&self) -> Option<u64> {
        self.state.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkbus_bb::testing::assert_that;

    #[test]
    fn push_then_pop_round_trips() {
        let sut = FixedSizeChunkQueue::<4>::new();
        assert_that!(unsafe { sut.push(42) }, eq None);
        assert_that!(unsafe { sut.pop() }, eq Some(42));
        assert_that!(sut.is_empty(), is_true);
    }

    #[test]
    fn push_beyond_capacity_discards_oldest() {
        let sut = FixedSizeChunkQueue::<2>::new();
        assert_that!(unsafe { sut.push(1) }, eq None);
        assert_that!(unsafe { sut.push(2) }, eq None);
        assert_that!(sut.is_full(), is_true);
        assert_that!(unsafe { sut.push(3) }, eq Some(1));
        assert_that!(unsafe { sut.pop() }, eq Some(2));
        assert_that!(unsafe { sut.pop() }, eq Some(3));
    }

    #[test]
    fn only_one_producer_and_consumer_can_be_acquired() {
        let sut = FixedSizeChunkQueue::<4>::new();
        let _p = sut.acquire_producer().unwrap();
        assert_that!(sut.acquire_producer().is_none(), is_true);
        let _c = sut.acquire_consumer().unwrap();
        assert_that!(sut.acquire_consumer().is_none(), is_true);
    }
}

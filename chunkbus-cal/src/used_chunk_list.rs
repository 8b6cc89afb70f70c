// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Every chunk a port currently holds (loaned but not yet released, or
//! received but not yet dropped) is registered here in addition to being
//! referenced from the port's own data structures. This is pure crash
//! safety: if the owning process dies while holding chunks, nothing in
//! its private memory is reachable anymore, but this list lives in the
//! shared segment, so a broker process can [`UsedChunkList::cleanup()`]
//! it and return every chunk still listed to its pool.
//!
//! The list never grows past a fixed capacity (one slot budgeted per
//! chunk a single port could plausibly hold at once); insertion returns
//! an error rather than blocking or growing when exhausted.

use crate::shm_allocator::PointerOffset;
use chunkbus_bb::lock_free::unique_index_set::{FixedSizeUniqueIndexSet, ReleaseMode};
use chunkbus_pal::iox_atomic::{IoxAtomicBool, IoxAtomicU64};
use core::sync::atomic::Ordering;

/// A chunk recorded in a [`UsedChunkList`]. Returned by
/// [`UsedChunkList::insert()`] and required to release the slot again
/// with [`UsedChunkList::remove()`] — callers must hold on to it exactly
/// like they hold on to the chunk itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UsedChunk {
    pub chunk_offset: PointerOffset,
    pub list_index: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UsedChunkInsertError {
    NoFreeSpace,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UsedChunkRemoveError {
    ChunkAlreadyFreed,
    InvalidIndex,
    WrongChunkReferenced,
}

/// Slot value `0` means "empty". Stored values are biased by one so that
/// the legitimate `PointerOffset` encoding `0` (segment 0, offset 0) does
/// not collide with the empty sentinel.
fn encode(offset: PointerOffset) -> u64 {
    offset.as_u64() + 1
}

fn decode(slot: u64) -> PointerOffset {
    PointerOffset::from(slot - 1)
}

/// Fixed-capacity, lock-free registry of chunks currently held by one port.
#[derive(Debug)]
pub struct UsedChunkList<const CAPACITY: usize> {
    data: [IoxAtomicU64; CAPACITY],
    free_indices: FixedSizeUniqueIndexSet<CAPACITY>,
    /// Set and cleared around every insert/remove so a concurrent
    /// [`UsedChunkList::cleanup()`] from a broker can tell, via a single
    /// acquire load, that no entry is mid-write.
    synchronizer: IoxAtomicBool,
}

impl<const CAPACITY: usize> Default for UsedChunkList<CAPACITY> {
    fn default() -> Self {
        Self {
            data: core::array::from_fn(|_| IoxAtomicU64::new(0)),
            free_indices: FixedSizeUniqueIndexSet::new(),
            synchronizer: IoxAtomicBool::new(false),
        }
    }
}

impl<const CAPACITY: usize> UsedChunkList<CAPACITY> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Registers `chunk_offset` as held. Fails with [`UsedChunkInsertError::NoFreeSpace`] if
    /// every slot is already occupied, e.g. because a port is holding more samples than its
    /// configured history/subscriber-queue budget allows.
    pub fn insert(&self, chunk_offset: PointerOffset) -> Result<UsedChunk, UsedChunkInsertError> {
        let index = unsafe { self.free_indices.acquire_raw_index() }
            .ok_or(UsedChunkInsertError::NoFreeSpace)?;

        self.data[index as usize].store(encode(chunk_offset), Ordering::Relaxed);
        self.synchronizer.store(false, Ordering::Release);

        Ok(UsedChunk {
            chunk_offset,
            list_index: index,
        })
    }

    /// Removes a previously inserted chunk, returning its offset so the caller can release the
    /// underlying chunk (decrement its reference count).
    pub fn remove(&self, used_chunk: UsedChunk) -> Result<PointerOffset, UsedChunkRemoveError> {
        if used_chunk.list_index as usize >= CAPACITY {
            return Err(UsedChunkRemoveError::InvalidIndex);
        }

        let slot = self.data[used_chunk.list_index as usize].load(Ordering::Acquire);
        if slot == 0 {
            return Err(UsedChunkRemoveError::ChunkAlreadyFreed);
        }

        if decode(slot) != used_chunk.chunk_offset {
            return Err(UsedChunkRemoveError::WrongChunkReferenced);
        }

        self.data[used_chunk.list_index as usize].store(0, Ordering::Relaxed);
        unsafe {
            self.free_indices
                .release_raw_index(used_chunk.list_index, ReleaseMode::Default)
        };
        self.synchronizer.store(false, Ordering::Release);

        Ok(used_chunk.chunk_offset)
    }

    /// Sweeps every still-occupied slot, clearing the list and returning the offset of each
    /// chunk that was held. Intended for a broker recovering resources from a process that died
    /// without releasing its chunks; the caller is responsible for releasing each returned
    /// chunk (decrementing its reference count) exactly once.
    ///
    /// Returns `None` if a concurrent insert/remove was observed mid-flight — the caller should
    /// retry once the owning process is confirmed dead and no longer mutating the list.
    pub fn cleanup(&self) -> Option<Vec<PointerOffset>> {
        if self.synchronizer.swap(true, Ordering::Acquire) {
            return None;
        }

        let mut released = Vec::new();
        for i in 0..CAPACITY {
            let slot = self.data[i].swap(0, Ordering::AcqRel);
            if slot != 0 {
                released.push(decode(slot));
                unsafe {
                    self.free_indices
                        .release_raw_index(i as u32, ReleaseMode::Default)
                };
            }
        }

        self.synchronizer.store(false, Ordering::Release);
        Some(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm_allocator::SegmentId;
    use chunkbus_bb::testing::assert_that;

    fn offset(value: usize) -> PointerOffset {
        PointerOffset::new_with_segment_id(value, SegmentId::new(0))
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let sut = UsedChunkList::<4>::new();
        let used = sut.insert(offset(128)).unwrap();
        let released = sut.remove(used).unwrap();
        assert_that!(released, eq offset(128));
    }

    #[test]
    fn insert_fails_when_capacity_exhausted() {
        let sut = UsedChunkList::<2>::new();
        let _a = sut.insert(offset(0)).unwrap();
        let _b = sut.insert(offset(64)).unwrap();
        assert_that!(sut.insert(offset(128)).is_err(), is_true);
    }

    #[test]
    fn remove_with_invalid_index_fails() {
        let sut = UsedChunkList::<2>::new();
        let bogus = UsedChunk {
            chunk_offset: offset(0),
            list_index: 99,
        };
        assert_that!(sut.remove(bogus), eq Err(UsedChunkRemoveError::InvalidIndex));
    }

    #[test]
    fn remove_same_chunk_twice_fails_on_second_call() {
        let sut = UsedChunkList::<2>::new();
        let used = sut.insert(offset(32)).unwrap();
        assert_that!(sut.remove(used).is_ok(), is_true);
        assert_that!(
            sut.remove(used),
            eq Err(UsedChunkRemoveError::ChunkAlreadyFreed)
        );
    }

    #[test]
    fn remove_with_mismatched_offset_fails() {
        let sut = UsedChunkList::<2>::new();
        let used = sut.insert(offset(32)).unwrap();
        let wrong = UsedChunk {
            chunk_offset: offset(64),
            ..used
        };
        assert_that!(
            sut.remove(wrong),
            eq Err(UsedChunkRemoveError::WrongChunkReferenced)
        );
    }

    #[test]
    fn cleanup_returns_every_held_chunk_and_resets_list() {
        let sut = UsedChunkList::<4>::new();
        let a = sut.insert(offset(0)).unwrap();
        let _b = sut.insert(offset(64)).unwrap();

        let released = sut.cleanup().unwrap();
        assert_that!(released.len(), eq 2);
        assert!(released.contains(&offset(0)));
        assert!(released.contains(&offset(64)));

        // every slot free again
        for _ in 0..4 {
            assert_that!(sut.insert(offset(0)).is_ok(), is_true);
        }
        let _ = a;
    }
}

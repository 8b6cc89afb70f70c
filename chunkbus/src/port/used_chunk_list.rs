// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Binds [`chunkbus_cal::used_chunk_list::UsedChunkList`] — which only
//! understands plain [`PointerOffset`]s — to the [`SharedChunk`] handles a
//! port actually works with. Registering a chunk here represents one more
//! share of it: the chunk's ref-count rises by one and the list itself
//! reconstructs an owned handle for that share again on `remove`/`cleanup`.

use crate::error::{ChunkReceiveResult, ClientSendError};
use crate::mem_pool_collection::PoolSet;
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::shm_allocator::PointerOffset;
pub use chunkbus_cal::used_chunk_list::{UsedChunk, UsedChunkInsertError, UsedChunkRemoveError};

/// A port's private registry of chunks it currently holds, bound to the segment its
/// [`PoolSet`] resolves offsets against.
#[derive(Debug)]
pub struct UsedChunkList<const CAPACITY: usize> {
    inner: chunkbus_cal::used_chunk_list::UsedChunkList<CAPACITY>,
    pool_set: PoolSet,
}

impl<const CAPACITY: usize> UsedChunkList<CAPACITY> {
    pub fn new(pool_set: PoolSet) -> Self {
        Self {
            inner: chunkbus_cal::used_chunk_list::UsedChunkList::new(),
            pool_set,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Registers `chunk` as held, adding one more share of it to the list's own bookkeeping.
    /// `chunk` itself is left untouched and still owned by the caller.
    pub fn insert(&self, chunk: &SharedChunk) -> Result<UsedChunk, UsedChunkInsertError> {
        debug_assert_eq!(
            chunk.segment_id(),
            self.pool_set.segment_id(),
            "chunk belongs to a different segment than this list was bound to"
        );
        let token = self.inner.insert(chunk.relative_offset())?;
        chunk.bump_ref_count_for_list();
        Ok(token)
    }

    /// Releases a previously inserted entry, handing back the share it represented.
    pub fn remove(&self, token: UsedChunk) -> Result<SharedChunk, UsedChunkRemoveError> {
        let offset = self.inner.remove(token)?;
        Ok(unsafe { self.pool_set.reconstruct(offset) })
    }

    /// Sweeps every still-registered chunk, releasing the list's share of each. Intended for a
    /// broker recovering resources from a process that died mid-operation.
    ///
    /// # Safety
    /// Must not race a concurrent `insert`/`remove` from the still-live owning process — see
    /// [`chunkbus_cal::used_chunk_list::UsedChunkList::cleanup()`].
    pub unsafe fn cleanup(&self) -> Option<Vec<SharedChunk>> {
        self.inner
            .cleanup()
            .map(|offsets| unsafe { self.reconstruct_all(offsets) })
    }

    unsafe fn reconstruct_all(&self, offsets: Vec<PointerOffset>) -> Vec<SharedChunk> {
        offsets
            .into_iter()
            .map(|offset| unsafe { self.pool_set.reconstruct(offset) })
            .collect()
    }
}

/// Maps a [`UsedChunkInsertError`] onto the error type a loan/take operation reports to its
/// caller: running out of bookkeeping slots looks the same as running out of chunks, from the
/// caller's point of view.
pub(crate) fn insert_err_as_receive_result(_: UsedChunkInsertError) -> ChunkReceiveResult {
    ChunkReceiveResult::NoChunkAvailable
}

pub(crate) fn insert_err_as_client_send_error(_: UsedChunkInsertError) -> ClientSendError {
    ClientSendError::InternalLogicError
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_pool_collection::{MemPoolCollection, PoolConfig};
    use chunkbus_bb::testing::assert_that;
    use chunkbus_cal::shm_allocator::SegmentId;
    use std::sync::Arc;

    fn pool_set(entries: &[(usize, usize)]) -> (Vec<u8>, PoolSet) {
        let chunk_region: usize = entries.iter().map(|(size, count)| size * count).sum();
        let mut memory = vec![0u8; chunk_region];
        let base = memory.as_mut_ptr() as usize;
        let config = entries
            .iter()
            .fold(PoolConfig::new(), |c, (size, count)| c.add(*size, *count));
        let collection = unsafe { MemPoolCollection::new(&config, 0, base) };
        (memory, PoolSet::new(Arc::new(collection), SegmentId::new(1)))
    }

    #[test]
    fn insert_adds_one_share_and_remove_returns_it() {
        let (_mem, pool_set) = pool_set(&[(128, 4)]);
        let chunk = pool_set.allocate(32, 8, 0, 0).unwrap();
        assert_that!(chunk.ref_count(), eq 1);

        let sut = UsedChunkList::<4>::new(pool_set.clone());
        let token = sut.insert(&chunk).unwrap();
        assert_that!(chunk.ref_count(), eq 2);

        let reconstructed = sut.remove(token).unwrap();
        assert_that!(reconstructed.ref_count(), eq 2);
        drop(reconstructed);
        assert_that!(chunk.ref_count(), eq 1);
    }

    #[test]
    fn the_same_chunk_can_be_inserted_twice_as_two_independent_shares() {
        let (_mem, pool_set) = pool_set(&[(128, 4)]);
        let chunk = pool_set.allocate(32, 8, 0, 0).unwrap();

        let sut = UsedChunkList::<4>::new(pool_set.clone());
        let first = sut.insert(&chunk).unwrap();
        let second = sut.insert(&chunk).unwrap();
        assert_that!(chunk.ref_count(), eq 3);

        drop(sut.remove(first).unwrap());
        drop(sut.remove(second).unwrap());
        assert_that!(chunk.ref_count(), eq 1);
    }

    #[test]
    fn cleanup_reconstructs_every_held_chunk() {
        let (_mem, pool_set) = pool_set(&[(128, 4)]);
        let a = pool_set.allocate(32, 8, 0, 0).unwrap();
        let b = pool_set.allocate(32, 8, 0, 0).unwrap();

        let sut = UsedChunkList::<4>::new(pool_set.clone());
        sut.insert(&a).unwrap();
        sut.insert(&b).unwrap();

        let swept = unsafe { sut.cleanup() }.unwrap();
        assert_that!(swept.len(), eq 2);
    }

    #[test]
    fn eight_parallel_inserters_fill_the_list_to_capacity_then_cleanup_drains_it() {
        const CAPACITY: usize = 100_000;
        const THREADS: usize = 8;
        const PER_THREAD: usize = CAPACITY / THREADS;

        let (_mem, pool_set) = pool_set(&[(128, CAPACITY + 1)]);
        let sut = UsedChunkList::<CAPACITY>::new(pool_set.clone());

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let pool_set = pool_set.clone();
                let sut = &sut;
                scope.spawn(move || {
                    for _ in 0..PER_THREAD {
                        let chunk = pool_set.allocate(32, 8, 0, 0).unwrap();
                        sut.insert(&chunk).unwrap();
                        // the list now owns the only remaining share of `chunk`.
                        drop(chunk);
                    }
                });
            }
        });

        // every slot is taken: one more insert has nowhere to go.
        let extra = pool_set.allocate(32, 8, 0, 0).unwrap();
        assert_that!(sut.insert(&extra).is_err(), is_true);
        drop(extra);

        let released = unsafe { sut.cleanup() }.unwrap();
        assert_that!(released.len(), eq CAPACITY);
        drop(released);

        assert_that!(pool_set.used(), eq 0);
    }
}

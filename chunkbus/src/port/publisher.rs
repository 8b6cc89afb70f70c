// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Publisher: loan a chunk, write into it, send it to every connected
//! subscriber's receive queue.

use crate::error::AllocError;
use crate::mem_pool_collection::PoolSet;
use crate::port::queue_policy::QueueFullPolicy;
use crate::port::used_chunk_list::{UsedChunk, UsedChunkList};
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::queue::FixedSizeChunkQueue;
use chunkbus_cal::shm_allocator::PointerOffset;
use chunkbus_pal::iox_atomic::IoxAtomicU64;
use core::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub struct Publisher<const CAPACITY: usize> {
    pool_set: PoolSet,
    loaned_chunks: UsedChunkList<CAPACITY>,
    subscribers: Mutex<Vec<Arc<FixedSizeChunkQueue<CAPACITY>>>>,
    policy: QueueFullPolicy,
    next_sequence_number: IoxAtomicU64,
}

impl<const CAPACITY: usize> Publisher<CAPACITY> {
    pub fn new(pool_set: PoolSet, policy: QueueFullPolicy) -> Self {
        let loaned_chunks = UsedChunkList::new(pool_set.clone());
        Self {
            pool_set,
            loaned_chunks,
            subscribers: Mutex::new(Vec::new()),
            policy,
            next_sequence_number: IoxAtomicU64::new(1),
        }
    }

    /// Connects a subscriber's receive queue to this publisher. Every subsequent `send` enqueues
    /// into it; samples already sent before this call are not retroactively delivered.
    pub fn connect_subscriber(&self, queue: Arc<FixedSizeChunkQueue<CAPACITY>>) {
        self.subscribers.lock().unwrap().push(queue);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Allocates a chunk sized to fit `payload_size`/`payload_align`. The returned loan must be
    /// `send()` to reach any subscriber; dropping it without sending releases the chunk back to
    /// its pool instead.
    pub fn loan(
        &self,
        payload_size: usize,
        payload_align: usize,
    ) -> Result<PublisherLoan<'_, CAPACITY>, AllocError> {
        let chunk = self.pool_set.allocate(payload_size, payload_align, 0, 0)?;
        let token = self
            .loaned_chunks
            .insert(&chunk)
            .map_err(|_| AllocError::RunningOutOfChunks)?;

        Ok(PublisherLoan {
            publisher: self,
            chunk: Some(chunk),
            token: Some(token),
        })
    }

    /// Blocks, honoring [`QueueFullPolicy::BlockProducer`], until `queue` has room. A no-op
    /// under [`QueueFullPolicy::DiscardOldestData`], since that policy never needs to wait.
    fn wait_for_room(&self, queue: &FixedSizeChunkQueue<CAPACITY>) {
        if self.policy == QueueFullPolicy::BlockProducer {
            while queue.is_full() {
                std::thread::yield_now();
            }
        }
    }

    fn send(&self, mut chunk: SharedChunk) {
        chunk.set_sequence_number(self.next_sequence_number.fetch_add(1, Ordering::Relaxed));
        let raw_offset = chunk.relative_offset().as_u64();

        let subscribers = self.subscribers.lock().unwrap();
        for queue in subscribers.iter() {
            self.wait_for_room(queue);
            // one more share for whichever subscriber eventually takes this slot.
            chunk.bump_ref_count_for_list();
            // SAFETY: one publisher drives every push onto a subscriber's queue; the
            // subscriber is the queue's sole consumer.
            if let Some(evicted) = unsafe { queue.push(raw_offset) } {
                self.release_discarded(evicted);
            }
        }
        // `chunk`'s own share (from the loan) is released here; the chunk now lives on purely
        // as the shares distributed into subscriber queues above, if any.
    }

    fn release_discarded(&self, raw_offset: u64) {
        let offset = PointerOffset::from(raw_offset);
        drop(unsafe { self.pool_set.reconstruct(offset) });
    }
}

/// A chunk allocated from a [`Publisher`], not yet sent. Dropping it without calling `send`
/// releases the chunk back to its pool.
pub struct PublisherLoan<'p, const CAPACITY: usize> {
    publisher: &'p Publisher<CAPACITY>,
    chunk: Option<SharedChunk>,
    token: Option<UsedChunk>,
}

impl<const CAPACITY: usize> PublisherLoan<'_, CAPACITY> {
    pub fn payload(&self) -> &[u8] {
        self.chunk.as_ref().expect("loan already sent").payload()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.chunk.as_mut().expect("loan already sent").payload_mut()
    }

    /// Hands the chunk to every connected subscriber, assigning it the next sequence number.
    pub fn send(mut self) {
        let token = self.token.take().expect("loan already sent");
        // release the loan-list's bookkeeping share; the original allocation's share (in
        // `self.chunk`) is what actually gets distributed below.
        if let Ok(bookkeeping_share) = self.publisher.loaned_chunks.remove(token) {
            drop(bookkeeping_share);
        }
        let chunk = self.chunk.take().expect("loan already sent");
        self.publisher.send(chunk);
    }
}

impl<const CAPACITY: usize> Drop for PublisherLoan<'_, CAPACITY> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.publisher.loaned_chunks.remove(token);
        }
        // `self.chunk`, if still `Some`, drops here too, releasing it back to its pool.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_pool_collection::{MemPoolCollection, PoolConfig};
    use chunkbus_bb::testing::assert_that;
    use chunkbus_cal::shm_allocator::SegmentId;

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
    fn send_without_subscribers_just_releases_the_chunk() {
        let (_mem, pool_set) = pool_set(&[(128, 2)]);
        let publisher = Publisher::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);

        let mut loan = publisher.loan(16, 8).unwrap();
        loan.payload_mut()[0] = 7;
        loan.send();

        assert_that!(pool_set.used(), eq 0);
    }

    #[test]
    fn send_delivers_to_every_connected_subscriber() {
        let (_mem, pool_set) = pool_set(&[(128, 4)]);
        let publisher = Publisher::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);

        let queue_a = Arc::new(FixedSizeChunkQueue::<4>::new());
        let queue_b = Arc::new(FixedSizeChunkQueue::<4>::new());
        publisher.connect_subscriber(Arc::clone(&queue_a));
        publisher.connect_subscriber(Arc::clone(&queue_b));

        let mut loan = publisher.loan(16, 8).unwrap();
        loan.payload_mut()[0] = 9;
        loan.send();

        assert_that!(queue_a.is_empty(), is_false);
        assert_that!(queue_b.is_empty(), is_false);
        assert_that!(pool_set.used(), eq 1);
    }

    #[test]
    fn dropping_an_unsent_loan_releases_the_chunk() {
        let (_mem, pool_set) = pool_set(&[(128, 2)]);
        let publisher = Publisher::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);

        let loan = publisher.loan(16, 8).unwrap();
        assert_that!(pool_set.used(), eq 1);
        drop(loan);
        assert_that!(pool_set.used(), eq 0);
    }

    #[test]
    fn a_full_subscriber_queue_under_discard_oldest_drops_the_oldest_sample() {
        let (_mem, pool_set) = pool_set(&[(128, 8)]);
        let publisher = Publisher::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);
        let queue = Arc::new(FixedSizeChunkQueue::<4>::new());
        publisher.connect_subscriber(Arc::clone(&queue));

        for byte in 0..6u8 {
            let mut loan = publisher.loan(16, 8).unwrap();
            loan.payload_mut()[0] = byte;
            loan.send();
        }

        // only the 4 most recent samples should still be reachable, and the pool should not have
        // grown unbounded from the discarded ones.
        assert_that!(queue.len(), eq 4);
        assert_that!(pool_set.used(), eq 4);
    }
}

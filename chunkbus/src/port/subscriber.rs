// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Subscriber: dequeue chunk references a connected publisher sent and
//! hand them back out as owned [`Sample`]s.

use crate::error::ChunkReceiveResult;
use crate::mem_pool_collection::PoolSet;
use crate::port::used_chunk_list::{insert_err_as_receive_result, UsedChunk, UsedChunkList};
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::queue::FixedSizeChunkQueue;
use chunkbus_cal::shm_allocator::PointerOffset;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Subscriber<const CAPACITY: usize> {
    pool_set: PoolSet,
    held_samples: UsedChunkList<CAPACITY>,
    queue: Arc<FixedSizeChunkQueue<CAPACITY>>,
}

impl<const CAPACITY: usize> Subscriber<CAPACITY> {
    /// Builds a new subscriber bound to `pool_set`'s segment, returning its receive queue so the
    /// caller can hand it to a [`crate::port::publisher::Publisher::connect_subscriber()`].
    pub fn new(pool_set: PoolSet) -> (Self, Arc<FixedSizeChunkQueue<CAPACITY>>) {
        let queue = Arc::new(FixedSizeChunkQueue::new());
        let held_samples = UsedChunkList::new(pool_set.clone());
        (
            Self {
                pool_set,
                held_samples,
                queue: Arc::clone(&queue),
            },
            queue,
        )
    }

    /// Dequeues one chunk reference, registering it in this subscriber's own used-chunk list for
    /// crash safety. Fails with [`ChunkReceiveResult::NoChunkAvailable`] if nothing is queued.
    pub fn take(&self) -> Result<Sample<'_, CAPACITY>, ChunkReceiveResult> {
        // SAFETY: one subscriber owns this queue's sole consumer side; the connected
        // publisher(s) are the only producers.
        let raw = unsafe { self.queue.pop() }
            .ok_or(ChunkReceiveResult::NoChunkAvailable)?;
        let chunk = unsafe { self.pool_set.reconstruct(PointerOffset::from(raw)) };
        let token = self
            .held_samples
            .insert(&chunk)
            .map_err(insert_err_as_receive_result)?;
        Ok(Sample {
            subscriber: self,
            chunk: Some(chunk),
            token: Some(token),
        })
    }

    /// As [`Subscriber::take()`], but polls until `deadline` elapses rather than failing
    /// immediately on an empty queue. A port-level convenience — the queue underneath never
    /// blocks on its own.
    pub fn timed_take(&self, deadline: Duration) -> Result<Sample<'_, CAPACITY>, ChunkReceiveResult> {
        let start = Instant::now();
        loop {
            match self.take() {
                Ok(sample) => return Ok(sample),
                Err(ChunkReceiveResult::NoChunkAvailable) => {
                    if start.elapsed() >= deadline {
                        return Err(ChunkReceiveResult::Timeout);
                    }
                    std::thread::yield_now();
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// An owned chunk reference handed out by [`Subscriber::take()`]. Dropping it removes it from
/// the subscriber's used-chunk list and releases the chunk back to its pool once every other
/// share is also gone.
pub struct Sample<'s, const CAPACITY: usize> {
    subscriber: &'s Subscriber<CAPACITY>,
    chunk: Option<SharedChunk>,
    token: Option<UsedChunk>,
}

impl<const CAPACITY: usize> Sample<'_, CAPACITY> {
    pub fn payload(&self) -> &[u8] {
        self.chunk.as_ref().expect("sample already dropped").payload()
    }

    pub fn sequence_number(&self) -> u64 {
        self.chunk
            .as_ref()
            .expect("sample already dropped")
            .sequence_number()
    }
}

impl<const CAPACITY: usize> Drop for Sample<'_, CAPACITY> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.subscriber.held_samples.remove(token);
        }
        // `self.chunk`, if still `Some`, drops here too, releasing its own share.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_pool_collection::{MemPoolCollection, PoolConfig};
    use crate::port::publisher::Publisher;
    use crate::port::queue_policy::QueueFullPolicy;
    use chunkbus_bb::testing::assert_that;
    use chunkbus_cal::shm_allocator::SegmentId;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    fn pool_set(entries: &[(usize, usize)]) -> (Vec<u8>, PoolSet) {
        let chunk_region: usize = entries.iter().map(|(size, count)| size * count).sum();
        let mut memory = vec![0u8; chunk_region];
        let base = memory.as_mut_ptr() as usize;
        let config = entries
            .iter()
            .fold(PoolConfig::new(), |c, (size, count)| c.add(*size, *count));
        let collection = unsafe { MemPoolCollection::new(&config, 0, base) };
        (memory, PoolSet::new(StdArc::new(collection), SegmentId::new(1)))
    }

    #[test]
    fn take_on_an_empty_queue_fails_with_no_chunk_available() {
        let (_mem, pool_set) = pool_set(&[(128, 2)]);
        let (subscriber, _queue) = Subscriber::<4>::new(pool_set);
        assert_that!(
            subscriber.take(),
            eq Err(ChunkReceiveResult::NoChunkAvailable)
        );
    }

    #[test]
    fn take_returns_what_was_published_and_releases_it_on_drop() {
        let (_mem, pool_set) = pool_set(&[(128, 4)]);
        let publisher = Publisher::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);
        let (subscriber, queue) = Subscriber::<4>::new(pool_set.clone());
        publisher.connect_subscriber(queue);

        let mut loan = publisher.loan(8, 8).unwrap();
        loan.payload_mut()[0] = 123;
        loan.send();

        let sample = subscriber.take().unwrap();
        assert_that!(sample.payload()[0], eq 123);
        assert_that!(pool_set.used(), eq 1);
        drop(sample);
        assert_that!(pool_set.used(), eq 0);
    }

    #[test]
    fn timed_take_on_an_empty_queue_times_out() {
        let (_mem, pool_set) = pool_set(&[(128, 2)]);
        let (subscriber, _queue) = Subscriber::<4>::new(pool_set);
        let start = std::time::Instant::now();
        let result = subscriber.timed_take(Duration::from_millis(10));
        assert_that!(result, eq Err(ChunkReceiveResult::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn one_producer_and_one_consumer_drain_a_hundred_thousand_samples_concurrently() {
        const MESSAGES: usize = 100_000;

        let (_mem, pool_set) = pool_set(&[(128, 64)]);
        let publisher = Publisher::<16>::new(pool_set.clone(), QueueFullPolicy::BlockProducer);
        let (subscriber, queue) = Subscriber::<16>::new(pool_set.clone());
        publisher.connect_subscriber(queue);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..MESSAGES {
                    let mut loan = publisher.loan(8, 8).unwrap();
                    loan.payload_mut()[0] = (i % 256) as u8;
                    loan.send();
                }
            });

            scope.spawn(|| {
                let mut received = 0usize;
                while received < MESSAGES {
                    match subscriber.take() {
                        Ok(sample) => {
                            received += 1;
                            drop(sample);
                        }
                        Err(ChunkReceiveResult::NoChunkAvailable) => std::thread::yield_now(),
                        Err(other) => panic!("unexpected receive error: {other:?}"),
                    }
                }
            });
        });

        assert_that!(pool_set.used(), eq 0);
    }
}

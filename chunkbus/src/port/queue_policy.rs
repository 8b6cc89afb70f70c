// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// What a producer does when a receiver's queue is already full.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueFullPolicy {
    /// Overwrite the oldest queued chunk; the newest data always wins. The default, and the
    /// only policy [`chunkbus_cal::queue::FixedSizeChunkQueue::push()`] itself implements.
    DiscardOldestData,
    /// Block the producer until the queue has room. Implemented at this layer by spinning on
    /// `is_full()` before pushing, since the queue itself never blocks.
    BlockProducer,
}

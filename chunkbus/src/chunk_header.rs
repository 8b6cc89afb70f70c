// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The metadata every chunk carries in its first bytes. Lives in shared
//! memory, so every mutable field is atomic: several processes may hold a
//! [`SharedChunk`](crate::shared_chunk::SharedChunk) pointing at the same
//! header and race to clone or drop it.

use crate::chunk_layout::ChunkLayout;
use chunkbus_pal::iox_atomic::IoxAtomicU64;
use core::sync::atomic::Ordering;

/// In-place metadata prefixed to every chunk handed out by a [`MemPool`](crate::mem_pool::MemPool).
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHeader {
    ref_count: IoxAtomicU64,
    sequence_number: IoxAtomicU64,
    chunk_size: u32,
    pool_id: u32,
    payload_size: u32,
    payload_alignment: u32,
    user_header_size: u32,
    user_header_alignment: u32,
    user_header_offset: u32,
    payload_offset: u32,
}

impl ChunkHeader {
    pub(crate) fn new(chunk_size: usize, pool_id: u32, layout: &ChunkLayout) -> Self {
        Self {
            ref_count: IoxAtomicU64::new(1),
            sequence_number: IoxAtomicU64::new(0),
            chunk_size: chunk_size as u32,
            pool_id,
            payload_size: layout.payload_size as u32,
            payload_alignment: layout.payload_alignment as u32,
            user_header_size: layout.user_header_size as u32,
            user_header_alignment: layout.user_header_alignment as u32,
            user_header_offset: layout.user_header_offset as u32,
            payload_offset: layout.payload_offset as u32,
        }
    }

    /// Size of the pool bucket this chunk was carved from, including the header itself.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    /// Index of the originating pool inside the owning segment's `MemPoolCollection`.
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size as usize
    }

    pub fn payload_alignment(&self) -> usize {
        self.payload_alignment as usize
    }

    pub fn user_header_size(&self) -> usize {
        self.user_header_size as usize
    }

    /// Monotonic sequence number assigned by the producer at publish time. `0` until first set.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Acquire)
    }

    pub fn set_sequence_number(&self, value: u64) {
        self.sequence_number.store(value, Ordering::Release);
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Returns the ref-count value after the increment.
    pub(crate) fn increment_ref_count(&self) -> u64 {
        self.ref_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the ref-count value after the decrement.
    pub(crate) fn decrement_ref_count(&self) -> u64 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// # Safety
    /// `self` must point at a fully constructed chunk of at least `payload_offset + payload_size`
    /// bytes.
    pub(crate) unsafe fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(self.payload_offset as usize) }
    }

    /// # Safety
    /// See [`ChunkHeader::payload_ptr()`].
    pub(crate) unsafe fn user_header_ptr(&self) -> Option<*mut u8> {
        if self.user_header_size == 0 {
            return None;
        }
        Some(unsafe { (self as *const Self as *mut u8).add(self.user_header_offset as usize) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_layout;
    use chunkbus_bb::testing::assert_that;

    #[test]
    fn new_header_starts_with_ref_count_one_and_sequence_number_zero() {
        let layout = chunk_layout::compute(core::mem::size_of::<ChunkHeader>(), 8, 64, 8, 0, 0);
        let header = ChunkHeader::new(256, 3, &layout);
        assert_that!(header.ref_count(), eq 1);
        assert_that!(header.sequence_number(), eq 0);
        assert_that!(header.pool_id(), eq 3);
        assert_that!(header.chunk_size(), eq 256);
    }

    #[test]
    fn increment_and_decrement_move_ref_count_by_one() {
        let layout = chunk_layout::compute(core::mem::size_of::<ChunkHeader>(), 8, 64, 8, 0, 0);
        let header = ChunkHeader::new(256, 0, &layout);
        assert_that!(header.increment_ref_count(), eq 2);
        assert_that!(header.decrement_ref_count(), eq 1);
        assert_that!(header.decrement_ref_count(), eq 0);
    }
}

// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client side of a request/response exchange. Requests are ordinary
//! chunks carrying a [`RequestHeader`] in their user-header region;
//! responses come back on this client's own queue, matched by
//! `sequence_id`.
//!
//! Connection follows a small state machine:
//! `NotConnected -> ConnectRequested -> Connected -> DisconnectRequested -> NotConnected`.
//! There is no broker in this crate to complete a pending connection asynchronously, so
//! `connect()` drives the transition straight through — the intermediate states exist so a
//! caller inspecting [`Client::state()`] mid-call, or a future broker-backed implementation,
//! sees the same shape the server side does.

use crate::error::ClientSendError;
use crate::mem_pool_collection::PoolSet;
use crate::port::headers::{ClientQueueId, RequestHeader};
use crate::port::queue_policy::QueueFullPolicy;
use crate::port::used_chunk_list::{insert_err_as_client_send_error, UsedChunk, UsedChunkList};
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::queue::FixedSizeChunkQueue;
use chunkbus_cal::shm_allocator::PointerOffset;
use chunkbus_pal::iox_atomic::{IoxAtomicU32, IoxAtomicU64};
use core::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientConnectionState {
    NotConnected,
    ConnectRequested,
    Connected,
    DisconnectRequested,
}

impl ClientConnectionState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::NotConnected,
            1 => Self::ConnectRequested,
            2 => Self::Connected,
            _ => Self::DisconnectRequested,
        }
    }
}

pub struct Client<const CAPACITY: usize> {
    pool_set: PoolSet,
    held_requests: UsedChunkList<CAPACITY>,
    request_queue: Mutex<Option<Arc<FixedSizeChunkQueue<CAPACITY>>>>,
    response_queue: Arc<FixedSizeChunkQueue<CAPACITY>>,
    client_queue_id: ClientQueueId,
    state: IoxAtomicU32,
    next_sequence_id: IoxAtomicU64,
    policy: QueueFullPolicy,
}

impl<const CAPACITY: usize> Client<CAPACITY> {
    /// Builds a new, unconnected client. Returns its own response queue alongside, which the
    /// server it eventually connects to must be given via
    /// [`crate::port::server::Server::register_client()`].
    pub fn new(
        pool_set: PoolSet,
        client_queue_id: ClientQueueId,
        policy: QueueFullPolicy,
    ) -> (Self, Arc<FixedSizeChunkQueue<CAPACITY>>) {
        let response_queue = Arc::new(FixedSizeChunkQueue::new());
        let held_requests = UsedChunkList::new(pool_set.clone());
        (
            Self {
                pool_set,
                held_requests,
                request_queue: Mutex::new(None),
                response_queue: Arc::clone(&response_queue),
                client_queue_id,
                state: IoxAtomicU32::new(ClientConnectionState::NotConnected as u32),
                next_sequence_id: IoxAtomicU64::new(1),
                policy,
            },
            response_queue,
        )
    }

    pub fn state(&self) -> ClientConnectionState {
        ClientConnectionState::from_u32(self.state.load(Ordering::Relaxed))
    }

    pub fn client_queue_id(&self) -> ClientQueueId {
        self.client_queue_id
    }

    /// This client's own response inbox, handed to the target server at registration time.
    pub fn response_queue(&self) -> Arc<FixedSizeChunkQueue<CAPACITY>> {
        Arc::clone(&self.response_queue)
    }

    /// Dequeues one response addressed to this client. Fails with
    /// [`crate::error::ChunkReceiveResult::NoChunkAvailable`] if nothing is queued yet.
    pub fn take_response(
        &self,
    ) -> Result<crate::shared_chunk::SharedChunk, crate::error::ChunkReceiveResult> {
        // SAFETY: this client owns the sole consumer side of its own response queue.
        let raw = unsafe { self.response_queue.pop() }
            .ok_or(crate::error::ChunkReceiveResult::NoChunkAvailable)?;
        Ok(unsafe { self.pool_set.reconstruct(PointerOffset::from(raw)) })
    }

    /// Connects to a server's request inbox, as returned by
    /// [`crate::port::server::Server::new()`].
    pub fn connect(&self, server_request_queue: Arc<FixedSizeChunkQueue<CAPACITY>>) {
        self.state.store(
            ClientConnectionState::ConnectRequested as u32,
            Ordering::Relaxed,
        );
        *self.request_queue.lock().unwrap() = Some(server_request_queue);
        self.state
            .store(ClientConnectionState::Connected as u32, Ordering::Relaxed);
    }

    pub fn disconnect(&self) {
        self.state.store(
            ClientConnectionState::DisconnectRequested as u32,
            Ordering::Relaxed,
        );
        *self.request_queue.lock().unwrap() = None;
        self.state
            .store(ClientConnectionState::NotConnected as u32, Ordering::Relaxed);
    }

    /// Allocates a request chunk. Fails with [`ClientSendError::NoConnectRequested`] unless the
    /// client is currently `Connected`.
    pub fn loan_request(
        &self,
        payload_size: usize,
        payload_align: usize,
    ) -> Result<RequestLoan<'_, CAPACITY>, ClientSendError> {
        if self.state() != ClientConnectionState::Connected {
            return Err(ClientSendError::NoConnectRequested);
        }

        let header_size = core::mem::size_of::<RequestHeader>();
        let header_align = core::mem::align_of::<RequestHeader>();
        let mut chunk = self
            .pool_set
            .allocate(payload_size, payload_align, header_size, header_align)
            .map_err(|e| match e {
                crate::error::AllocError::PayloadTooLarge => ClientSendError::PayloadTooLarge,
                crate::error::AllocError::RunningOutOfChunks => ClientSendError::RunningOutOfChunks,
            })?;

        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader {
            client_queue_id: self.client_queue_id,
            sequence_id,
        };
        write_header(&mut chunk, &header);

        let token = self
            .held_requests
            .insert(&chunk)
            .map_err(insert_err_as_client_send_error)?;

        Ok(RequestLoan {
            client: self,
            chunk: Some(chunk),
            token: Some(token),
        })
    }

    fn send(&self, chunk: SharedChunk) -> Result<(), ClientSendError> {
        let queue_guard = self.request_queue.lock().unwrap();
        let queue = queue_guard
            .as_ref()
            .ok_or(ClientSendError::ServerNotAvailable)?;

        if self.policy == QueueFullPolicy::BlockProducer {
            while queue.is_full() {
                std::thread::yield_now();
            }
        }

        let raw_offset = chunk.relative_offset().as_u64();
        // SAFETY: one client drives every push onto its own request handle to the server's
        // inbox; the server is the queue's sole consumer.
        if let Some(evicted) = unsafe { queue.push(raw_offset) } {
            drop(unsafe { self.pool_set.reconstruct(PointerOffset::from(evicted)) });
        }
        Ok(())
    }
}

fn write_header(chunk: &mut SharedChunk, header: &RequestHeader) {
    let Some(bytes) = chunk.user_header_mut() else {
        chunkbus_bb::fatal_panic!(from chunk, "request chunks always carry a user-header");
    };
    let header_bytes = unsafe {
        core::slice::from_raw_parts(
            header as *const RequestHeader as *const u8,
            core::mem::size_of::<RequestHeader>(),
        )
    };
    bytes[..header_bytes.len()].copy_from_slice(header_bytes);
}

/// An allocated, not-yet-sent request.
pub struct RequestLoan<'c, const CAPACITY: usize> {
    client: &'c Client<CAPACITY>,
    chunk: Option<SharedChunk>,
    token: Option<UsedChunk>,
}

impl<const CAPACITY: usize> RequestLoan<'_, CAPACITY> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.chunk.as_mut().expect("request already sent").payload_mut()
    }

    pub fn send(mut self) -> Result<(), ClientSendError> {
        let token = self.token.take().expect("request already sent");
        if let Ok(bookkeeping_share) = self.client.held_requests.remove(token) {
            drop(bookkeeping_share);
        }
        let chunk = self.chunk.take().expect("request already sent");
        self.client.send(chunk)
    }
}

impl<const CAPACITY: usize> Drop for RequestLoan<'_, CAPACITY> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.client.held_requests.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_pool_collection::MemPoolCollection;
    use crate::port::headers::RequestHeader;
    use chunkbus_bb::testing::assert_that;
    use chunkbus_cal::shm_allocator::SegmentId;
    use std::sync::Arc as StdArc;

    fn pool_set(entries: &[(usize, usize)]) -> (Vec<u8>, PoolSet) {
        let chunk_region: usize = entries.iter().map(|(size, count)| size * count).sum();
        let mut memory = vec![0u8; chunk_region];
        let base = memory.as_mut_ptr() as usize;
        let config = entries.iter().fold(
            crate::mem_pool_collection::PoolConfig::new(),
            |c, (size, count)| c.add(*size, *count),
        );
        let collection = unsafe { MemPoolCollection::new(&config, 0, base) };
        (memory, PoolSet::new(StdArc::new(collection), SegmentId::new(1)))
    }

    #[test]
    fn a_new_client_is_not_connected_and_rejects_loans() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (client, _response_queue) = Client::<4>::new(pool_set, 1, QueueFullPolicy::DiscardOldestData);
        assert_that!(client.state(), eq ClientConnectionState::NotConnected);
        assert_that!(
            client.loan_request(8, 8),
            eq Err(ClientSendError::NoConnectRequested)
        );
    }

    #[test]
    fn connecting_then_sending_delivers_the_request_with_its_header() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (client, _response_queue) = Client::<4>::new(pool_set.clone(), 7, QueueFullPolicy::DiscardOldestData);
        let server_inbox = StdArc::new(FixedSizeChunkQueue::<4>::new());
        client.connect(StdArc::clone(&server_inbox));
        assert_that!(client.state(), eq ClientConnectionState::Connected);

        let mut loan = client.loan_request(8, 8).unwrap();
        loan.payload_mut()[0] = 42;
        loan.send().unwrap();

        assert_that!(server_inbox.is_empty(), is_false);
        let raw = unsafe { server_inbox.pop() }.unwrap();
        let chunk = unsafe { pool_set.reconstruct(PointerOffset::from(raw)) };
        let header = chunk.user_header().unwrap();
        let request_header = unsafe { &*(header.as_ptr() as *const RequestHeader) };
        assert_that!(request_header.client_queue_id, eq 7);
        assert_that!(chunk.payload()[0], eq 42);
    }

    #[test]
    fn disconnecting_returns_to_not_connected_and_rejects_further_loans() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (client, _response_queue) = Client::<4>::new(pool_set, 1, QueueFullPolicy::DiscardOldestData);
        let server_inbox = StdArc::new(FixedSizeChunkQueue::<4>::new());
        client.connect(server_inbox);
        client.disconnect();
        assert_that!(client.state(), eq ClientConnectionState::NotConnected);
        assert_that!(
            client.loan_request(8, 8),
            eq Err(ClientSendError::NoConnectRequested)
        );
    }
}

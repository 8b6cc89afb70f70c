// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server side of a request/response exchange. Offer state follows
//! `NotOffered -> Offered -> NotOffered`; requests may only be taken and
//! responses only sent while `Offered`. Connected clients are tracked the
//! same way a publisher tracks connected subscribers — a plain list of
//! queues to distribute into, keyed here by the client's queue id so a
//! response can be routed back without a second, separate client table.

use crate::error::{ServerRequestResult, ServerSendError};
use crate::mem_pool_collection::PoolSet;
use crate::port::headers::{ClientQueueId, RequestHeader, ResponseHeader};
use crate::port::queue_policy::QueueFullPolicy;
use crate::port::used_chunk_list::{UsedChunk, UsedChunkList};
use crate::shared_chunk::SharedChunk;
use chunkbus_cal::queue::FixedSizeChunkQueue;
use chunkbus_cal::shm_allocator::PointerOffset;
use chunkbus_pal::iox_atomic::IoxAtomicBool;
use core::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub struct Server<const CAPACITY: usize> {
    pool_set: PoolSet,
    held_requests: UsedChunkList<CAPACITY>,
    held_responses: UsedChunkList<CAPACITY>,
    request_queue: Arc<FixedSizeChunkQueue<CAPACITY>>,
    clients: Mutex<Vec<(ClientQueueId, Arc<FixedSizeChunkQueue<CAPACITY>>)>>,
    offered: IoxAtomicBool,
    policy: QueueFullPolicy,
}

impl<const CAPACITY: usize> Server<CAPACITY> {
    /// Builds a new server, not yet offered. Returns its request inbox, which clients connect to
    /// via [`crate::port::client::Client::connect()`].
    pub fn new(pool_set: PoolSet, policy: QueueFullPolicy) -> (Self, Arc<FixedSizeChunkQueue<CAPACITY>>) {
        let request_queue = Arc::new(FixedSizeChunkQueue::new());
        let held_requests = UsedChunkList::new(pool_set.clone());
        let held_responses = UsedChunkList::new(pool_set.clone());
        (
            Self {
                pool_set,
                held_requests,
                held_responses,
                request_queue: Arc::clone(&request_queue),
                clients: Mutex::new(Vec::new()),
                offered: IoxAtomicBool::new(false),
                policy,
            },
            request_queue,
        )
    }

    /// Registers a client's response queue so [`Server::loan_response()`] can route to it. This
    /// list of connected clients is the only "client table" this server keeps — the same
    /// structure a publisher uses to track connected subscribers.
    pub fn register_client(&self, client_queue_id: ClientQueueId, response_queue: Arc<FixedSizeChunkQueue<CAPACITY>>) {
        self.clients.lock().unwrap().push((client_queue_id, response_queue));
    }

    pub fn unregister_client(&self, client_queue_id: ClientQueueId) {
        self.clients.lock().unwrap().retain(|(id, _)| *id != client_queue_id);
    }

    pub fn offer(&self) {
        self.offered.store(true, Ordering::Relaxed);
    }

    pub fn stop_offer(&self) {
        self.offered.store(false, Ordering::Relaxed);
    }

    pub fn is_offered(&self) -> bool {
        self.offered.load(Ordering::Relaxed)
    }

    /// Dequeues one pending request. If the queue is empty, the error distinguishes whether the
    /// server is currently offered (the ordinary idle case) or not (usually a sign the caller
    /// forgot to `offer()` before polling).
    pub fn take_request(&self) -> Result<RequestSample<'_, CAPACITY>, ServerRequestResult> {
        // SAFETY: one server owns this queue's sole consumer side; connected clients are the
        // only producers.
        match unsafe { self.request_queue.pop() } {
            Some(raw) => {
                let chunk = unsafe { self.pool_set.reconstruct(PointerOffset::from(raw)) };
                let header = read_request_header(&chunk);
                let token = self
                    .held_requests
                    .insert(&chunk)
                    .map_err(|_| ServerRequestResult::NoPendingRequests)?;
                Ok(RequestSample {
                    server: self,
                    header,
                    chunk: Some(chunk),
                    token: Some(token),
                })
            }
            None if self.is_offered() => Err(ServerRequestResult::NoPendingRequests),
            None => Err(ServerRequestResult::NoPendingRequestsAndServerDoesNotOffer),
        }
    }

    /// As [`Server::take_request()`], but polls until `deadline` elapses rather than failing
    /// immediately on an empty queue. Still reports
    /// [`ServerRequestResult::NoPendingRequestsAndServerDoesNotOffer`] immediately, without
    /// waiting out the deadline, since no request will ever arrive while not offered.
    pub fn timed_take_request(&self, deadline: std::time::Duration) -> Result<RequestSample<'_, CAPACITY>, ServerRequestResult> {
        let start = std::time::Instant::now();
        loop {
            match self.take_request() {
                Ok(sample) => return Ok(sample),
                Err(ServerRequestResult::NoPendingRequests) => {
                    if start.elapsed() >= deadline {
                        return Err(ServerRequestResult::Timeout);
                    }
                    std::thread::yield_now();
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Allocates a response chunk addressed to the client that sent `request_header`. Fails with
    /// [`ServerSendError::NotOffered`] unless currently offered, and with
    /// [`ServerSendError::ClientNotAvailable`] if that client is no longer registered.
    pub fn loan_response(
        &self,
        request_header: &RequestHeader,
        payload_size: usize,
        payload_align: usize,
    ) -> Result<ResponseLoan<'_, CAPACITY>, ServerSendError> {
        if !self.is_offered() {
            return Err(ServerSendError::NotOffered);
        }

        let target_queue = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| *id == request_header.client_queue_id)
            .map(|(_, queue)| Arc::clone(queue))
            .ok_or(ServerSendError::ClientNotAvailable)?;

        let header_size = core::mem::size_of::<ResponseHeader>();
        let header_align = core::mem::align_of::<ResponseHeader>();
        let mut chunk = self
            .pool_set
            .allocate(payload_size, payload_align, header_size, header_align)
            .map_err(|e| match e {
                crate::error::AllocError::PayloadTooLarge => ServerSendError::PayloadTooLarge,
                crate::error::AllocError::RunningOutOfChunks => ServerSendError::RunningOutOfChunks,
            })?;

        let response_header = ResponseHeader {
            client_queue_id: request_header.client_queue_id,
            sequence_id: request_header.sequence_id,
        };
        write_response_header(&mut chunk, &response_header);

        let token = self
            .held_responses
            .insert(&chunk)
            .map_err(|_| ServerSendError::ClientNotAvailable)?;

        Ok(ResponseLoan {
            server: self,
            target_queue,
            chunk: Some(chunk),
            token: Some(token),
        })
    }

    fn send(&self, chunk: SharedChunk, target_queue: &FixedSizeChunkQueue<CAPACITY>) {
        if self.policy == QueueFullPolicy::BlockProducer {
            while target_queue.is_full() {
                std::thread::yield_now();
            }
        }

        let raw_offset = chunk.relative_offset().as_u64();
        // SAFETY: a client's response queue has exactly one producer, this server, by
        // construction of the request/response protocol.
        if let Some(evicted) = unsafe { target_queue.push(raw_offset) } {
            drop(unsafe { self.pool_set.reconstruct(PointerOffset::from(evicted)) });
        }
    }
}

fn read_request_header(chunk: &SharedChunk) -> RequestHeader {
    let Some(bytes) = chunk.user_header() else {
        chunkbus_bb::fatal_panic!(from chunk, "request chunks always carry a user-header");
    };
    unsafe { *(bytes.as_ptr() as *const RequestHeader) }
}

fn write_response_header(chunk: &mut SharedChunk, header: &ResponseHeader) {
    let Some(bytes) = chunk.user_header_mut() else {
        chunkbus_bb::fatal_panic!(from chunk, "response chunks always carry a user-header");
    };
    let header_bytes = unsafe {
        core::slice::from_raw_parts(
            header as *const ResponseHeader as *const u8,
            core::mem::size_of::<ResponseHeader>(),
        )
    };
    bytes[..header_bytes.len()].copy_from_slice(header_bytes);
}

/// A dequeued, still-registered request.
pub struct RequestSample<'s, const CAPACITY: usize> {
    server: &'s Server<CAPACITY>,
    header: RequestHeader,
    chunk: Option<SharedChunk>,
    token: Option<UsedChunk>,
}

impl<const CAPACITY: usize> RequestSample<'_, CAPACITY> {
    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        self.chunk.as_ref().expect("request already dropped").payload()
    }
}

impl<const CAPACITY: usize> Drop for RequestSample<'_, CAPACITY> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.server.held_requests.remove(token);
        }
    }
}

/// An allocated, not-yet-sent response.
pub struct ResponseLoan<'s, const CAPACITY: usize> {
    server: &'s Server<CAPACITY>,
    target_queue: Arc<FixedSizeChunkQueue<CAPACITY>>,
    chunk: Option<SharedChunk>,
    token: Option<UsedChunk>,
}

impl<const CAPACITY: usize> ResponseLoan<'_, CAPACITY> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.chunk.as_mut().expect("response already sent").payload_mut()
    }

    pub fn send(mut self) {
        let token = self.token.take().expect("response already sent");
        if let Ok(bookkeeping_share) = self.server.held_responses.remove(token) {
            drop(bookkeeping_share);
        }
        let chunk = self.chunk.take().expect("response already sent");
        self.server.send(chunk, &self.target_queue);
    }
}

impl<const CAPACITY: usize> Drop for ResponseLoan<'_, CAPACITY> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = self.server.held_responses.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_pool_collection::{MemPoolCollection, PoolConfig};
    use crate::port::client::Client;
    use chunkbus_bb::testing::assert_that;
    use chunkbus_cal::shm_allocator::SegmentId;
    use std::sync::Arc as StdArc;

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
    fn take_request_without_offering_reports_the_not_offered_empty_case() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (server, _inbox) = Server::<4>::new(pool_set, QueueFullPolicy::DiscardOldestData);
        assert_that!(
            server.take_request(),
            eq Err(ServerRequestResult::NoPendingRequestsAndServerDoesNotOffer)
        );
    }

    #[test]
    fn timed_take_request_on_an_offered_but_empty_server_times_out() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (server, _inbox) = Server::<4>::new(pool_set, QueueFullPolicy::DiscardOldestData);
        server.offer();
        let start = std::time::Instant::now();
        let result = server.timed_take_request(std::time::Duration::from_millis(10));
        assert_that!(result, eq Err(ServerRequestResult::Timeout));
        assert!(start.elapsed() >= std::time::Duration::from_millis(10));
    }

    #[test]
    fn loan_response_without_offering_fails_with_not_offered() {
        let (_mem, pool_set) = pool_set(&[(256, 2)]);
        let (server, _inbox) = Server::<4>::new(pool_set, QueueFullPolicy::DiscardOldestData);
        let header = RequestHeader {
            client_queue_id: 1,
            sequence_id: 1,
        };
        assert_that!(
            server.loan_response(&header, 8, 8),
            eq Err(ServerSendError::NotOffered)
        );
    }

    #[test]
    fn a_full_request_response_round_trip() {
        let (_mem, pool_set) = pool_set(&[(256, 4)]);
        let (server, server_inbox) = Server::<4>::new(pool_set.clone(), QueueFullPolicy::DiscardOldestData);
        server.offer();

        let (client, client_responses) =
            Client::<4>::new(pool_set, client_id(7), QueueFullPolicy::DiscardOldestData);
        client.connect(server_inbox);
        server.register_client(client.client_queue_id(), client_responses);

        let mut request = client.loan_request(8, 8).unwrap();
        request.payload_mut()[0] = 5;
        request.send().unwrap();

        let received = server.take_request().unwrap();
        assert_that!(received.payload()[0], eq 5);
        assert_that!(received.header().client_queue_id, eq client_id(7));

        let mut response = server.loan_response(received.header(), 8, 8).unwrap();
        response.payload_mut()[0] = 6;
        response.send();

        let reply = client.take_response().unwrap();
        assert_that!(reply.payload()[0], eq 6);
    }

    fn client_id(value: ClientQueueId) -> ClientQueueId {
        value
    }
}

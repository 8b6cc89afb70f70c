// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error enumerations shared across the chunk lifecycle. Every fallible
//! operation returns one of these instead of panicking or unwinding;
//! values are plain, comparable data so they travel across process
//! boundaries by value.

/// Failure from [`crate::mem_pool_collection::PoolSet::allocate()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AllocError {
    /// No configured pool's chunk size is large enough for the requested layout.
    PayloadTooLarge,
    /// A pool big enough exists, but it has no free chunks left.
    RunningOutOfChunks,
}

/// Failure from [`crate::segment_manager::SegmentManager::writable_segment()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SegmentLookupError {
    NoWriteAccess,
    NoSegmentFound,
}

/// Fatal misconfiguration detected while building a [`crate::segment_manager::SegmentManager`].
/// Reported through the configured [`FatalErrorSink`] rather than a direct `panic!`, so a test
/// harness can observe it without aborting.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SegmentConfigError {
    MultipleSegmentConfigEntriesWithSameName,
    SegmentInsufficientSegmentIds,
}

/// Failure creating the shared memory backing a [`crate::segment::Segment`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SegmentCreationError {
    SharedMemoryCreationFailed,
    UnknownGroup,
}

/// Lets an embedding application decide what happens when the broker hits a fatal configuration
/// error at startup: log and abort, log and continue with the offending entry skipped, or
/// anything else appropriate for a test harness. The default sink logs at
/// [`chunkbus_bb::log::LogLevel::Error`] and does not panic.
pub trait FatalErrorSink: Send + Sync {
    fn report(&self, error: SegmentConfigError, detail: &str);
}

/// Logs the error and otherwise does nothing; used when no sink is supplied.
#[derive(Debug, Default)]
pub struct LoggingFatalErrorSink;

impl FatalErrorSink for LoggingFatalErrorSink {
    fn report(&self, error: SegmentConfigError, detail: &str) {
        chunkbus_bb::error!("fatal segment configuration error {:?}: {}", error, detail);
    }
}

/// Failure from [`crate::port::subscriber::Subscriber::take()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChunkReceiveResult {
    /// The receive queue was empty.
    NoChunkAvailable,
    /// A deadline passed before a chunk arrived.
    Timeout,
}

/// Failure from [`crate::port::client::Client::loan_request()`] /
/// [`crate::port::client::RequestLoan::send()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientSendError {
    /// The client is not in the `CONNECTED` state.
    NoConnectRequested,
    /// The server this client connected to is no longer reachable.
    ServerNotAvailable,
    /// The requested payload does not fit any configured pool.
    PayloadTooLarge,
    /// Every pool big enough for the request is currently exhausted.
    RunningOutOfChunks,
    /// The allocator or queue state was inconsistent; indicates a bug rather than contention.
    InternalLogicError,
}

/// Failure from [`crate::port::server::Server::loan_response()`] /
/// [`crate::port::server::ResponseLoan::send()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerSendError {
    /// The server is not currently `OFFERED`.
    NotOffered,
    /// The client this response targets is no longer registered.
    ClientNotAvailable,
    /// The requested payload does not fit any configured pool.
    PayloadTooLarge,
    /// Every pool big enough for the request is currently exhausted.
    RunningOutOfChunks,
}

/// Failure from [`crate::port::server::Server::take_request()`] /
/// [`crate::port::server::Server::timed_take_request()`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerRequestResult {
    /// No request is queued right now, but the server is not offering either — distinguished
    /// from the ordinary empty case because it usually means the caller forgot to call `offer()`.
    NoPendingRequestsAndServerDoesNotOffer,
    /// No request is queued right now; the server is offered and this is the normal idle case.
    NoPendingRequests,
    /// A deadline passed before a request arrived.
    Timeout,
}

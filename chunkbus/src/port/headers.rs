// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request/response metadata placed in a chunk's user-header region by the
//! client/server ports. A response carries the originating client's queue
//! id back so the server can route it to the right client without keeping
//! a table of its own — the list of connected clients it already tracks to
//! distribute responses serves that purpose.

/// Identifies a connected client's response queue, stable for the lifetime of one connection.
pub type ClientQueueId = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub client_queue_id: ClientQueueId,
    pub sequence_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub client_queue_id: ClientQueueId,
    pub sequence_id: u64,
}

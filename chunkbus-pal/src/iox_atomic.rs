// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Atomic integer and boolean types used throughout the lock-free building
//! blocks. Kept as a distinct module, rather than having every crate reach
//! for `core::sync::atomic` directly, so that a platform lacking native
//! atomics of a given width can swap in a lock-based emulation here without
//! touching call sites.

#[allow(clippy::disallowed_types)]
pub type IoxAtomicBool = core::sync::atomic::AtomicBool;

#[allow(clippy::disallowed_types)]
pub type IoxAtomicUsize = core::sync::atomic::AtomicUsize;

#[allow(clippy::disallowed_types)]
pub type IoxAtomicIsize = core::sync::atomic::AtomicIsize;

#[allow(clippy::disallowed_types)]
pub type IoxAtomicU32 = core::sync::atomic::AtomicU32;

#[allow(clippy::disallowed_types)]
pub type IoxAtomicU64 = core::sync::atomic::AtomicU64;

#[allow(clippy::disallowed_types)]
pub type IoxAtomicI64 = core::sync::atomic::AtomicI64;

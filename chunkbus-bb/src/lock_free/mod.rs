// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free multi-producer multi-consumer building blocks.

pub mod unique_index_set;

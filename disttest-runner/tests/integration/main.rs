// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests: real worker hosts and misbehaving fake workers talking to
//! a controller over in-memory streams.

mod basic;
mod fixtures;
mod protocol;

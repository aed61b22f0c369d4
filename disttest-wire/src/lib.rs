// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The wire protocol spoken between a disttest controller and its workers.
//!
//! A controller sends [`ControllerMessage`]s naming one test at a time; the
//! worker answers with a stream of [`WorkerMessage`]s describing what happened
//! while that test ran, terminated by a [`RunResult`].
//!
//! Every message is encoded as a single line of JSON. Exceptions never cross
//! the boundary as live objects: a failure travels as a [`FailureSummary`],
//! which holds the name of the error type and its rendered text.
//!
//! This crate is pure data. Transport and async concerns live in
//! `disttest-runner`.

mod codec;
mod errors;
mod messages;
mod outcome;

pub use codec::*;
pub use errors::*;
pub use messages::*;
pub use outcome::*;

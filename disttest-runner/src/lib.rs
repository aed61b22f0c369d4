// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Worker-side outcome reporting and controller-side result replay for
//! distributed test runs.
//!
//! The basic flow of a run:
//!
//! 1. The [`Controller`](controller::Controller) sends a
//!    [`RunCommand`](disttest_wire::RunCommand) to a worker.
//! 2. On the worker, the [`WorkerHost`](worker::WorkerHost) hands the test to
//!    a [`TestFramework`](worker::TestFramework), which reports what happens
//!    through a [`WorkerReporter`](reporter::WorkerReporter).
//! 3. Every reporting call becomes a frame on the wire. Failures are reduced
//!    to a type name and rendered text before the call returns.
//! 4. On the controller, a [`WorkerSession`](controller::WorkerSession)
//!    reads the frames in order and the
//!    [`ResultSink`](controller::ResultSink) replays them onto a
//!    [`ResultAggregator`](aggregator::ResultAggregator).
//!
//! Every dispatched test ends up with exactly one terminal outcome on the
//! controller, even when a worker misbehaves or disappears.

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod errors;
mod helpers;
pub mod output;
pub mod reporter;
pub mod transport;
pub mod worker;

// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker-side outcome reporting.
//!
//! A test framework reports what happens during a test through the
//! [`OutcomeReporter`] trait. The [`WorkerReporter`] implementation renders
//! failures to text inside each call and forwards the resulting
//! [`ReporterEvent`]s to an [`EventSink`], blocking until the sink has taken
//! them.

mod exc_info;
mod imp;

pub use exc_info::*;
pub use imp::*;

use crate::errors::ReportError;
use disttest_wire::TestId;

/// The set of calls a test framework makes while running one test.
///
/// Every call names the test it is about. Exactly one of the six outcome
/// calls should be made per test.
pub trait OutcomeReporter {
    /// Called when the test starts running.
    fn start_test(&mut self, test_id: &TestId) -> Result<(), ReportError>;

    /// Called when the test has finished running.
    fn stop_test(&mut self, test_id: &TestId) -> Result<(), ReportError>;

    /// The test passed.
    fn add_success(&mut self, test_id: &TestId) -> Result<(), ReportError>;

    /// The test hit an error outside of its assertions.
    fn add_error(&mut self, test_id: &TestId, error: ExcInfo<'_>) -> Result<(), ReportError>;

    /// The test failed an assertion.
    fn add_failure(&mut self, test_id: &TestId, failure: ExcInfo<'_>) -> Result<(), ReportError>;

    /// The test was skipped.
    fn add_skip(&mut self, test_id: &TestId, reason: &str) -> Result<(), ReportError>;

    /// The test was expected to fail, and did.
    fn add_expected_failure(
        &mut self,
        test_id: &TestId,
        error: ExcInfo<'_>,
        reason: Option<&str>,
    ) -> Result<(), ReportError>;

    /// The test was expected to fail, but passed.
    fn add_unexpected_success(
        &mut self,
        test_id: &TestId,
        reason: Option<&str>,
    ) -> Result<(), ReportError>;
}

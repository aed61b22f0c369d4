// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExcInfo, OutcomeReporter};
use crate::errors::ReportError;
use disttest_wire::{FailureSummary, OutcomeKind, OutcomeMessage, TestId};
use tracing::debug;

/// An event produced by a [`WorkerReporter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReporterEvent {
    /// The test started.
    TestStarted {
        /// The test.
        test_id: TestId,
    },

    /// The test produced an outcome.
    Outcome(OutcomeMessage),

    /// The test stopped.
    TestStopped {
        /// The test.
        test_id: TestId,
    },
}

/// Where a [`WorkerReporter`] sends its events.
pub trait EventSink {
    /// Hands `event` to the transport, returning once it has been written.
    fn send(&mut self, event: ReporterEvent) -> Result<(), ReportError>;
}

impl EventSink for Vec<ReporterEvent> {
    fn send(&mut self, event: ReporterEvent) -> Result<(), ReportError> {
        self.push(event);
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn send(&mut self, event: ReporterEvent) -> Result<(), ReportError> {
        (**self).send(event)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// An [`OutcomeReporter`] bound to a single test.
///
/// Calls naming any other test are rejected with
/// [`ReportError::TestMismatch`], and only the first terminal outcome is
/// accepted.
#[derive(Debug)]
pub struct WorkerReporter<S> {
    test_id: TestId,
    sink: S,
    lifecycle: Lifecycle,
    terminal: Option<OutcomeKind>,
    max_error_text_bytes: usize,
}

impl<S: EventSink> WorkerReporter<S> {
    /// Creates a reporter for `test_id` that forwards events to `sink`.
    pub fn new(test_id: TestId, sink: S, max_error_text_bytes: usize) -> Self {
        Self {
            test_id,
            sink,
            lifecycle: Lifecycle::NotStarted,
            terminal: None,
            max_error_text_bytes,
        }
    }

    /// Returns the test this reporter is bound to.
    pub fn test_id(&self) -> &TestId {
        &self.test_id
    }

    /// Returns the terminal outcome reported so far, if any.
    pub fn terminal_outcome(&self) -> Option<OutcomeKind> {
        self.terminal
    }

    /// Consumes the reporter, returning its sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Reports an error outcome that was synthesized rather than produced by
    /// the test framework.
    pub(crate) fn report_synthesized_error(
        &mut self,
        failure: FailureSummary,
    ) -> Result<(), ReportError> {
        self.check_terminal(OutcomeKind::Error)?;
        let test_id = self.test_id.clone();
        self.send_outcome(OutcomeMessage::Error { test_id, failure })
    }

    fn check_test(&self, test_id: &TestId) -> Result<(), ReportError> {
        if *test_id != self.test_id {
            return Err(ReportError::TestMismatch {
                expected: self.test_id.clone(),
                actual: test_id.clone(),
            });
        }
        Ok(())
    }

    fn check_outcome(&self, test_id: &TestId, kind: OutcomeKind) -> Result<(), ReportError> {
        self.check_test(test_id)?;
        if self.lifecycle == Lifecycle::Stopped {
            return Err(ReportError::LifecycleOutOfOrder {
                test_id: test_id.clone(),
                event: outcome_call(kind),
            });
        }
        self.check_terminal(kind)
    }

    fn check_terminal(&self, attempted: OutcomeKind) -> Result<(), ReportError> {
        match self.terminal {
            Some(previous) => Err(ReportError::DuplicateOutcome {
                test_id: self.test_id.clone(),
                previous,
                attempted,
            }),
            None => Ok(()),
        }
    }

    fn summarize(&self, exc_info: ExcInfo<'_>) -> FailureSummary {
        exc_info.summarize(self.max_error_text_bytes)
    }

    fn send_outcome(&mut self, outcome: OutcomeMessage) -> Result<(), ReportError> {
        let kind = outcome.kind();
        debug!(test_id = %self.test_id, "reporting {kind}");
        self.sink.send(ReporterEvent::Outcome(outcome))?;
        self.terminal = Some(kind);
        Ok(())
    }
}

impl<S: EventSink> OutcomeReporter for WorkerReporter<S> {
    fn start_test(&mut self, test_id: &TestId) -> Result<(), ReportError> {
        self.check_test(test_id)?;
        if self.lifecycle != Lifecycle::NotStarted || self.terminal.is_some() {
            return Err(ReportError::LifecycleOutOfOrder {
                test_id: test_id.clone(),
                event: "start_test",
            });
        }
        self.sink.send(ReporterEvent::TestStarted {
            test_id: test_id.clone(),
        })?;
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn stop_test(&mut self, test_id: &TestId) -> Result<(), ReportError> {
        self.check_test(test_id)?;
        if self.lifecycle == Lifecycle::Stopped {
            return Err(ReportError::LifecycleOutOfOrder {
                test_id: test_id.clone(),
                event: "stop_test",
            });
        }
        self.sink.send(ReporterEvent::TestStopped {
            test_id: test_id.clone(),
        })?;
        self.lifecycle = Lifecycle::Stopped;
        Ok(())
    }

    fn add_success(&mut self, test_id: &TestId) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::Success)?;
        self.send_outcome(OutcomeMessage::Success {
            test_id: test_id.clone(),
        })
    }

    fn add_error(&mut self, test_id: &TestId, error: ExcInfo<'_>) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::Error)?;
        let failure = self.summarize(error);
        self.send_outcome(OutcomeMessage::Error {
            test_id: test_id.clone(),
            failure,
        })
    }

    fn add_failure(&mut self, test_id: &TestId, failure: ExcInfo<'_>) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::Failure)?;
        let failure = self.summarize(failure);
        self.send_outcome(OutcomeMessage::Failure {
            test_id: test_id.clone(),
            failure,
        })
    }

    fn add_skip(&mut self, test_id: &TestId, reason: &str) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::Skip)?;
        self.send_outcome(OutcomeMessage::Skip {
            test_id: test_id.clone(),
            reason: reason.to_owned(),
        })
    }

    fn add_expected_failure(
        &mut self,
        test_id: &TestId,
        error: ExcInfo<'_>,
        reason: Option<&str>,
    ) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::ExpectedFailure)?;
        let failure = self.summarize(error);
        self.send_outcome(OutcomeMessage::ExpectedFailure {
            test_id: test_id.clone(),
            failure,
            reason: reason.map(ToOwned::to_owned),
        })
    }

    fn add_unexpected_success(
        &mut self,
        test_id: &TestId,
        reason: Option<&str>,
    ) -> Result<(), ReportError> {
        self.check_outcome(test_id, OutcomeKind::UnexpectedSuccess)?;
        self.send_outcome(OutcomeMessage::UnexpectedSuccess {
            test_id: test_id.clone(),
            reason: reason.map(ToOwned::to_owned),
        })
    }
}

fn outcome_call(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::Success => "add_success",
        OutcomeKind::Error => "add_error",
        OutcomeKind::Failure => "add_failure",
        OutcomeKind::Skip => "add_skip",
        OutcomeKind::ExpectedFailure => "add_expected_failure",
        OutcomeKind::UnexpectedSuccess => "add_unexpected_success",
    }
}

// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// An opaque, globally unique name for a test, such as
/// `my_crate::tests::parse_empty`.
///
/// A `TestId` correlates a [`RunCommand`] with every message produced while
/// running that test. It is never interpreted by the protocol.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(SmolStr);

impl TestId {
    /// Creates a new test identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self(SmolStr::from(id))
    }
}

impl AsRef<str> for TestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
impl proptest::arbitrary::Arbitrary for TestId {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with((): ()) -> Self::Strategy {
        use proptest::prelude::*;

        "[a-z_][a-z0-9_]{0,12}(::[a-z_][a-z0-9_]{0,12}){0,4}"
            .prop_map(TestId::from)
            .boxed()
    }
}

/// The terminal classification of a single test's execution.
///
/// Exactly one outcome is recorded per test.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    /// The test passed.
    Success,

    /// The test raised an error that was not an assertion failure.
    Error,

    /// An assertion in the test failed.
    Failure,

    /// The test was skipped.
    Skip,

    /// The test was marked as expected to fail, and it failed.
    ExpectedFailure,

    /// The test was marked as expected to fail, but it passed.
    UnexpectedSuccess,
}

impl OutcomeKind {
    /// All outcome kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Success,
        Self::Error,
        Self::Failure,
        Self::Skip,
        Self::ExpectedFailure,
        Self::UnexpectedSuccess,
    ];

    /// Returns the tag used for this kind on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Failure => "failure",
            Self::Skip => "skip",
            Self::ExpectedFailure => "expected-failure",
            Self::UnexpectedSuccess => "unexpected-success",
        }
    }

    /// Looks up an outcome kind by its wire tag.
    ///
    /// Returns `None` for tags this version of the protocol doesn't know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Returns true if outcomes of this kind carry a [`FailureSummary`].
    pub fn carries_failure(self) -> bool {
        matches!(self, Self::Error | Self::Failure | Self::ExpectedFailure)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure, reduced to what can safely cross a process boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "kebab-case")]
pub struct FailureSummary {
    /// The fully-qualified name of the error type, e.g.
    /// `std::io::error::Error`.
    pub error_class: String,

    /// The rendered error and backtrace. This is the only diagnostic detail
    /// that survives the trip.
    pub error_text: String,
}

impl FailureSummary {
    /// Creates a new failure summary.
    pub fn new(error_class: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            error_class: error_class.into(),
            error_text: error_text.into(),
        }
    }
}

/// One reporting event for one test.
///
/// Success carries no payload: the presence of the message is the signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum OutcomeMessage {
    /// The test passed.
    Success {
        /// The test this outcome belongs to.
        test_id: TestId,
    },

    /// The test errored.
    Error {
        /// The test this outcome belongs to.
        test_id: TestId,

        /// The error.
        failure: FailureSummary,
    },

    /// The test failed an assertion.
    Failure {
        /// The test this outcome belongs to.
        test_id: TestId,

        /// The assertion failure.
        failure: FailureSummary,
    },

    /// The test was skipped.
    Skip {
        /// The test this outcome belongs to.
        test_id: TestId,

        /// Why the test was skipped.
        reason: String,
    },

    /// The test was expected to fail, and did.
    ExpectedFailure {
        /// The test this outcome belongs to.
        test_id: TestId,

        /// The failure that was expected.
        failure: FailureSummary,

        /// The reason the test is expected to fail, if one was given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The test was expected to fail, but passed.
    UnexpectedSuccess {
        /// The test this outcome belongs to.
        test_id: TestId,

        /// The reason the test was expected to fail, if one was given.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl OutcomeMessage {
    /// Returns the test this outcome belongs to.
    pub fn test_id(&self) -> &TestId {
        match self {
            Self::Success { test_id }
            | Self::Error { test_id, .. }
            | Self::Failure { test_id, .. }
            | Self::Skip { test_id, .. }
            | Self::ExpectedFailure { test_id, .. }
            | Self::UnexpectedSuccess { test_id, .. } => test_id,
        }
    }

    /// Returns the kind of this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success { .. } => OutcomeKind::Success,
            Self::Error { .. } => OutcomeKind::Error,
            Self::Failure { .. } => OutcomeKind::Failure,
            Self::Skip { .. } => OutcomeKind::Skip,
            Self::ExpectedFailure { .. } => OutcomeKind::ExpectedFailure,
            Self::UnexpectedSuccess { .. } => OutcomeKind::UnexpectedSuccess,
        }
    }

    /// Returns the failure carried by this outcome, if any.
    pub fn failure(&self) -> Option<&FailureSummary> {
        match self {
            Self::Error { failure, .. }
            | Self::Failure { failure, .. }
            | Self::ExpectedFailure { failure, .. } => Some(failure),
            Self::Success { .. } | Self::Skip { .. } | Self::UnexpectedSuccess { .. } => None,
        }
    }

    /// Returns the human-readable reason carried by this outcome, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Skip { reason, .. } => Some(reason),
            Self::ExpectedFailure { reason, .. } | Self::UnexpectedSuccess { reason, .. } => {
                reason.as_deref()
            }
            Self::Success { .. } | Self::Error { .. } | Self::Failure { .. } => None,
        }
    }
}

/// A request to run a single test on a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "kebab-case")]
pub struct RunCommand {
    /// The test to run.
    pub test_id: TestId,
}

/// The worker's reply to a [`RunCommand`], sent once the test has finished
/// and every outcome for it has been acknowledged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(rename_all = "kebab-case")]
pub struct RunResult {
    /// The test that was run.
    pub test_id: TestId,

    /// True if the run completed without the worker failing. This says
    /// nothing about whether the test itself passed.
    pub success: bool,
}

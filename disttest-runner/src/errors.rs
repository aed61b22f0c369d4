// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by disttest.

use crate::controller::WorkerId;
use camino::Utf8PathBuf;
use config::ConfigError;
use disttest_wire::{DecodeError, EncodeError, OutcomeKind, TestId};
use std::{error, fmt, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinError;

/// An error returned by an [`OutcomeReporter`](crate::reporter::OutcomeReporter)
/// method.
///
/// Apart from [`Self::Transport`] and [`Self::ChannelClosed`], these errors
/// indicate a bug in the test framework or host driving the reporter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportError {
    /// A call named a test other than the one the reporter is bound to.
    #[error("reporter is bound to test `{expected}`, but a call was made for `{actual}`")]
    TestMismatch {
        /// The test the reporter is bound to.
        expected: TestId,

        /// The test named in the call.
        actual: TestId,
    },

    /// A second terminal outcome was reported for the same test.
    #[error(
        "test `{test_id}` already reported a terminal outcome ({previous}), \
         cannot also report {attempted}"
    )]
    DuplicateOutcome {
        /// The test.
        test_id: TestId,

        /// The outcome that was reported first.
        previous: OutcomeKind,

        /// The outcome that was rejected.
        attempted: OutcomeKind,
    },

    /// `start_test` or `stop_test` was called out of order.
    #[error("test `{test_id}`: {event} called out of order")]
    LifecycleOutOfOrder {
        /// The test.
        test_id: TestId,

        /// The lifecycle call, e.g. `start_test`.
        event: &'static str,
    },

    /// The host stopped accepting events.
    #[error("outbound channel closed while reporting for test `{test_id}`")]
    ChannelClosed {
        /// The test being reported on.
        test_id: TestId,
    },

    /// The host accepted the event but failed to write it.
    #[error("failed to write report for test `{test_id}`")]
    Transport {
        /// The test being reported on.
        test_id: TestId,

        /// The underlying error.
        #[source]
        error: TransportError,
    },
}

/// An error that occurs while reading or writing frames.
///
/// Cheap to clone, so that one failed write can be reported to every caller
/// waiting on it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Reading from the underlying stream failed.
    #[error("error reading frame")]
    Read(#[source] Arc<io::Error>),

    /// Writing to the underlying stream failed.
    #[error("error writing frame")]
    Write(#[source] Arc<io::Error>),

    /// A frame could not be encoded.
    #[error(transparent)]
    Encode(Arc<EncodeError>),
}

impl TransportError {
    /// Returns true if the stream can no longer be used.
    ///
    /// Encoding failures only affect the frame being encoded.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Read(_) | Self::Write(_) => true,
            Self::Encode(_) => false,
        }
    }
}

impl From<EncodeError> for TransportError {
    fn from(error: EncodeError) -> Self {
        Self::Encode(Arc::new(error))
    }
}

/// An error returned by a [`TestFramework`](crate::worker::TestFramework)
/// that could not run a test.
///
/// The worker host turns this into an error outcome if the framework didn't
/// report one itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunTestError {
    /// The framework doesn't know this test.
    #[error("test `{test_id}` not found")]
    NotFound {
        /// The test that was requested.
        test_id: TestId,
    },

    /// The framework failed before the test body ran.
    #[error("failed to set up test `{test_id}`")]
    Setup {
        /// The test.
        test_id: TestId,

        /// The underlying error.
        #[source]
        error: Box<dyn error::Error + Send + Sync>,
    },

    /// A reporting call failed.
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// A fatal error encountered by a [`WorkerHost`](crate::worker::WorkerHost).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The connection to the controller failed.
    #[error("transport error while serving controller")]
    Transport(#[from] TransportError),

    /// The thread running a test could not be joined.
    #[error("thread running test `{test_id}` failed to join")]
    Join {
        /// The test that was running.
        test_id: TestId,

        /// The underlying error.
        #[source]
        error: JoinError,
    },
}

/// An error that ends a controller's use of one worker.
///
/// By the time this is returned, the affected test has already been given a
/// terminal error outcome.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerSessionError {
    /// The run command could not be sent.
    #[error("failed to send run command for `{test_id}` to {worker}")]
    Send {
        /// The worker.
        worker: WorkerId,

        /// The test that was to be run.
        test_id: TestId,

        /// The underlying error.
        #[source]
        error: TransportError,
    },

    /// The worker went away while running a test.
    #[error("{worker} disconnected while running `{test_id}`")]
    Disconnected {
        /// The worker.
        worker: WorkerId,

        /// The test that was running.
        test_id: TestId,

        /// The transport error, if the stream didn't simply end.
        #[source]
        error: Option<TransportError>,
    },

    /// The worker didn't finish a test in time.
    #[error("{worker} did not finish `{test_id}` within {timeout:?}")]
    Timeout {
        /// The worker.
        worker: WorkerId,

        /// The test that was running.
        test_id: TestId,

        /// The configured timeout.
        timeout: Duration,
    },

    /// The worker finished a different test than the one it was asked to run.
    #[error("{worker} finished `{actual}` while running `{expected}`")]
    Desynchronized {
        /// The worker.
        worker: WorkerId,

        /// The test that was dispatched.
        expected: TestId,

        /// The test the worker claims to have finished.
        actual: TestId,
    },
}

impl WorkerSessionError {
    /// Returns the test that was affected.
    pub fn test_id(&self) -> &TestId {
        match self {
            Self::Send { test_id, .. }
            | Self::Disconnected { test_id, .. }
            | Self::Timeout { test_id, .. } => test_id,
            Self::Desynchronized { expected, .. } => expected,
        }
    }
}

/// A message from a worker that the controller rejected.
///
/// Violations never stop the controller: they are logged, collected into the
/// [`RunSummary`](crate::controller::RunSummary), and the session carries on.
#[derive(Debug, Error)]
#[error("protocol violation from {worker}")]
pub struct ProtocolViolation {
    /// The worker that sent the message.
    pub worker: WorkerId,

    /// The test in flight when the message arrived, if any.
    pub in_flight: Option<TestId>,

    /// What went wrong.
    #[source]
    pub kind: ProtocolViolationKind,
}

/// The kind of a [`ProtocolViolation`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolViolationKind {
    /// The frame could not be decoded.
    #[error("undecodable frame")]
    Decode(#[source] DecodeError),

    /// A message named a test that isn't in flight.
    #[error("`{message_type}` for `{actual}`, which is not in flight")]
    UnexpectedTest {
        /// The `type` tag of the message.
        message_type: &'static str,

        /// The test the message named.
        actual: TestId,
    },

    /// A second terminal outcome arrived for the test in flight.
    #[error("duplicate terminal outcome {attempted} (already recorded {previous})")]
    DuplicateOutcome {
        /// The outcome that was recorded.
        previous: OutcomeKind,

        /// The outcome that was rejected.
        attempted: OutcomeKind,
    },

    /// The worker finished a run without reporting a terminal outcome.
    #[error("run finished without a terminal outcome")]
    MissingOutcome,
}

/// An error that occurred while loading configuration.
#[derive(Debug, Error)]
#[error(
    "failed to parse disttest config{}",
    .config_file.as_ref().map_or_else(String::new, |file| format!(" at `{file}`"))
)]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self { config_file, kind }
    }

    /// Returns the config file that failed to parse, if the error is
    /// attributable to one.
    pub fn config_file(&self) -> Option<&Utf8PathBuf> {
        self.config_file.as_ref()
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of [`ConfigParseError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// Sources could not be merged.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// The merged config didn't match the schema.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// Displays an error followed by its chain of sources, separated by `: `.
///
/// Used where an error has to be reduced to a single line of text, such as
/// log messages and synthesized outcome text.
pub struct DisplayErrorChain<E>(E);

impl<E: error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

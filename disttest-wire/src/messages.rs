// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{OutcomeMessage, RunCommand, RunResult, TestId};
use serde::{Deserialize, Serialize};

/// A message sent from a worker to the controller.
///
/// For every [`RunCommand`] the worker sends, in order: `TestStarted`, zero
/// or more `Outcome`s, `TestStopped`, and finally `RunFinished`. The
/// framework driving the test may omit the lifecycle messages; the
/// `RunFinished` message is always sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum WorkerMessage {
    /// The test framework started running a test.
    TestStarted {
        /// The test that started.
        test_id: TestId,
    },

    /// The test framework reported an outcome.
    Outcome {
        /// The sequence number of this frame on its connection. The
        /// controller acknowledges it with [`ControllerMessage::Ack`].
        seq: u64,

        /// The outcome.
        outcome: OutcomeMessage,
    },

    /// The test framework finished running a test.
    TestStopped {
        /// The test that stopped.
        test_id: TestId,
    },

    /// The worker is done with a [`RunCommand`].
    RunFinished {
        /// The result of the run.
        result: RunResult,
    },
}

impl WorkerMessage {
    /// The `type` tags of every worker message.
    pub const TYPE_TAGS: &'static [&'static str] =
        &["test-started", "outcome", "test-stopped", "run-finished"];

    /// Returns the `type` tag of this message.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::TestStarted { .. } => "test-started",
            Self::Outcome { .. } => "outcome",
            Self::TestStopped { .. } => "test-stopped",
            Self::RunFinished { .. } => "run-finished",
        }
    }

    /// Returns the test this message is about.
    pub fn test_id(&self) -> &TestId {
        match self {
            Self::TestStarted { test_id } | Self::TestStopped { test_id } => test_id,
            Self::Outcome { outcome, .. } => outcome.test_id(),
            Self::RunFinished { result } => &result.test_id,
        }
    }
}

/// A message sent from the controller to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ControllerMessage {
    /// Run a single test.
    Run {
        /// The test to run.
        command: RunCommand,
    },

    /// The controller has received the outcome frame with this sequence
    /// number.
    ///
    /// Frames the controller rejected are acknowledged too: an ack means
    /// receipt, not acceptance.
    Ack {
        /// The acknowledged sequence number.
        seq: u64,
    },

    /// No more tests will be sent. The worker should exit once it has
    /// finished its current run.
    Shutdown,
}

impl ControllerMessage {
    /// The `type` tags of every controller message.
    pub const TYPE_TAGS: &'static [&'static str] = &["run", "ack", "shutdown"];

    /// Returns the `type` tag of this message.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Ack { .. } => "ack",
            Self::Shutdown => "shutdown",
        }
    }
}

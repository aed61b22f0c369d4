// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::aggregator::{ErrorClassRegistry, ResultAggregator, SharedAggregator};
use disttest_wire::{FailureSummary, OutcomeMessage, TestId};
use std::sync::Arc;
use tracing::debug;

/// Replays outcomes received from workers into a [`ResultAggregator`].
#[derive(Debug)]
pub struct ResultSink<A> {
    aggregator: SharedAggregator<A>,
    registry: Arc<ErrorClassRegistry>,
}

impl<A> Clone for ResultSink<A> {
    fn clone(&self) -> Self {
        Self {
            aggregator: self.aggregator.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<A: ResultAggregator> ResultSink<A> {
    /// Creates a new sink.
    pub fn new(aggregator: SharedAggregator<A>, registry: Arc<ErrorClassRegistry>) -> Self {
        Self {
            aggregator,
            registry,
        }
    }

    /// Returns the aggregator outcomes are recorded into.
    pub fn aggregator(&self) -> &SharedAggregator<A> {
        &self.aggregator
    }

    /// Returns the registry used to resolve error classes.
    pub fn registry(&self) -> &ErrorClassRegistry {
        &self.registry
    }

    /// Records `outcome` with the aggregator.
    ///
    /// The caller is responsible for checking that the outcome belongs to the
    /// test in flight and is its only terminal outcome.
    pub fn dispatch(&self, outcome: OutcomeMessage) {
        debug!(test_id = %outcome.test_id(), "recording {}", outcome.kind());
        match outcome {
            OutcomeMessage::Success { test_id } => self.on_success(&test_id),
            OutcomeMessage::Error { test_id, failure } => self.on_error(&test_id, failure),
            OutcomeMessage::Failure { test_id, failure } => self.on_failure(&test_id, failure),
            OutcomeMessage::Skip { test_id, reason } => self.on_skip(&test_id, reason),
            OutcomeMessage::ExpectedFailure {
                test_id,
                failure,
                reason,
            } => self.on_expected_failure(&test_id, failure, reason),
            OutcomeMessage::UnexpectedSuccess { test_id, reason } => {
                self.on_unexpected_success(&test_id, reason)
            }
        }
    }

    /// Records an error outcome produced by disttest rather than a worker.
    pub fn synthesize_error(&self, test_id: &TestId, error_class: &str, error_text: String) {
        debug!(%test_id, "synthesizing {error_class}");
        self.on_error(test_id, FailureSummary::new(error_class, error_text));
    }

    fn on_success(&self, test_id: &TestId) {
        self.aggregator.record(|agg| agg.add_success(test_id));
    }

    fn on_error(&self, test_id: &TestId, failure: FailureSummary) {
        let failure = self.registry.normalize(failure);
        self.aggregator.record(|agg| agg.add_error(test_id, failure));
    }

    fn on_failure(&self, test_id: &TestId, failure: FailureSummary) {
        let failure = self.registry.normalize(failure);
        self.aggregator.record(|agg| agg.add_failure(test_id, failure));
    }

    fn on_skip(&self, test_id: &TestId, reason: String) {
        self.aggregator.record(|agg| agg.add_skip(test_id, reason));
    }

    fn on_expected_failure(&self, test_id: &TestId, failure: FailureSummary, reason: Option<String>) {
        let failure = self.registry.normalize(failure);
        self.aggregator
            .record(|agg| agg.add_expected_failure(test_id, failure, reason));
    }

    fn on_unexpected_success(&self, test_id: &TestId, reason: Option<String>) {
        self.aggregator
            .record(|agg| agg.add_unexpected_success(test_id, reason));
    }
}

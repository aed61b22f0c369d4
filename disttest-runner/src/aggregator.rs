// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Controller-side result aggregation.
//!
//! Failures arrive from workers as a class name plus rendered text. Here they
//! become [`NormalizedFailure`]s: values that answer "what type is this?" and
//! "what does it print?", and nothing else. No stack frames are ever
//! reconstructed.

use crate::config::ControllerConfig;
use disttest_wire::{FailureSummary, OutcomeKind, TestId};
use smol_str::SmolStr;
use std::{
    any::type_name,
    collections::BTreeSet,
    error, fmt,
    sync::{Arc, Mutex, PoisonError},
};

/// Class names of the error outcomes disttest synthesizes itself.
pub mod synthesized {
    /// The worker's connection closed before the test finished.
    pub const WORKER_LOST: &str = "disttest::WorkerLost";

    /// The test finished without the framework reporting an outcome.
    pub const NO_OUTCOME: &str = "disttest::NoOutcome";

    /// The worker's messages stopped matching the test in flight.
    pub const DESYNCHRONIZED: &str = "disttest::Desynchronized";

    /// The test didn't finish within the controller's run timeout.
    pub const RUN_TIMEOUT: &str = "disttest::RunTimeout";

    /// The test framework panicked outside of any test-level handling.
    pub const PANIC: &str = "disttest::Panic";

    /// The framework could not run the test at all.
    pub const RUN_TEST_FAILED: &str = "disttest::RunTestFailed";

    pub(crate) const ALL: [&str; 6] = [
        WORKER_LOST,
        NO_OUTCOME,
        DESYNCHRONIZED,
        RUN_TIMEOUT,
        PANIC,
        RUN_TEST_FAILED,
    ];
}

/// The class of a [`NormalizedFailure`], as resolved on the controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A class the controller recognizes.
    Known {
        /// The fully-qualified class name.
        name: SmolStr,
    },

    /// A class the controller doesn't recognize, replaced with a placeholder.
    Placeholder {
        /// The placeholder class name.
        placeholder: SmolStr,

        /// The class name the worker sent.
        original: SmolStr,
    },
}

impl ErrorClass {
    /// Returns the effective class name: the known name, or the placeholder.
    pub fn name(&self) -> &str {
        match self {
            Self::Known { name } => name,
            Self::Placeholder { placeholder, .. } => placeholder,
        }
    }

    /// Returns the class name as sent by the worker.
    pub fn original_name(&self) -> &str {
        match self {
            Self::Known { name } => name,
            Self::Placeholder { original, .. } => original,
        }
    }

    /// Returns true if this is a placeholder.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known { name } => f.write_str(name),
            Self::Placeholder {
                placeholder,
                original,
            } => write!(f, "{placeholder} ({original})"),
        }
    }
}

/// A failure reconstructed on the controller.
///
/// Displays as the error text rendered on the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedFailure {
    class: ErrorClass,
    text: String,
}

impl NormalizedFailure {
    /// Creates a new normalized failure.
    pub fn new(class: ErrorClass, text: impl Into<String>) -> Self {
        Self {
            class,
            text: text.into(),
        }
    }

    /// Returns the resolved class.
    pub fn class(&self) -> &ErrorClass {
        &self.class
    }

    /// Returns the text rendered on the worker.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns true if this failure's class is known and is the Rust type
    /// `E`.
    pub fn is<E: ?Sized + 'static>(&self) -> bool {
        match &self.class {
            ErrorClass::Known { name } => name == type_name::<E>(),
            ErrorClass::Placeholder { .. } => false,
        }
    }
}

impl fmt::Display for NormalizedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl error::Error for NormalizedFailure {}

/// The set of error class names the controller recognizes.
#[derive(Clone, Debug)]
pub struct ErrorClassRegistry {
    known: BTreeSet<SmolStr>,
    placeholder: SmolStr,
}

impl ErrorClassRegistry {
    /// The default placeholder class name.
    pub const DEFAULT_PLACEHOLDER: &'static str = "disttest::UnresolvedError";

    /// Creates a registry with the built-in classes and the given placeholder
    /// name.
    pub fn new(placeholder: impl AsRef<str>) -> Self {
        let mut this = Self {
            known: BTreeSet::new(),
            placeholder: SmolStr::new(placeholder),
        };
        this.register::<std::io::Error>()
            .register::<std::fmt::Error>()
            .register::<std::num::ParseIntError>()
            .register::<std::num::ParseFloatError>()
            .register::<std::str::Utf8Error>()
            .register::<std::string::FromUtf8Error>()
            .register::<std::env::VarError>()
            .register::<std::sync::mpsc::RecvError>()
            // Panic payloads.
            .register::<&'static str>()
            .register::<String>();
        for name in synthesized::ALL {
            this.register_name(name);
        }
        this
    }

    /// Creates a registry from controller configuration.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let mut this = Self::new(&config.placeholder_error_class);
        for name in &config.known_error_classes {
            this.register_name(name);
        }
        this
    }

    /// Registers the Rust type `E` as a known class.
    pub fn register<E: ?Sized + 'static>(&mut self) -> &mut Self {
        self.register_name(type_name::<E>())
    }

    /// Registers a class by name.
    pub fn register_name(&mut self, name: impl AsRef<str>) -> &mut Self {
        self.known.insert(SmolStr::new(name));
        self
    }

    /// Returns the placeholder class name.
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Resolves a class name sent by a worker.
    ///
    /// Never fails: unknown names resolve to the placeholder.
    pub fn resolve(&self, name: &str) -> ErrorClass {
        match self.known.get(name) {
            Some(name) => ErrorClass::Known { name: name.clone() },
            None => ErrorClass::Placeholder {
                placeholder: self.placeholder.clone(),
                original: SmolStr::new(name),
            },
        }
    }

    /// Turns a failure received from a worker into a [`NormalizedFailure`].
    pub fn normalize(&self, summary: FailureSummary) -> NormalizedFailure {
        let FailureSummary {
            error_class,
            error_text,
        } = summary;
        NormalizedFailure::new(self.resolve(&error_class), error_text)
    }
}

impl Default for ErrorClassRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PLACEHOLDER)
    }
}

/// A process-local object that test outcomes are recorded into.
///
/// The [`ResultSink`](crate::controller::ResultSink) calls exactly one of
/// these methods per test.
pub trait ResultAggregator {
    /// Records a passing test.
    fn add_success(&mut self, test_id: &TestId);

    /// Records a test that errored.
    fn add_error(&mut self, test_id: &TestId, failure: NormalizedFailure);

    /// Records a test that failed an assertion.
    fn add_failure(&mut self, test_id: &TestId, failure: NormalizedFailure);

    /// Records a skipped test.
    fn add_skip(&mut self, test_id: &TestId, reason: String);

    /// Records a test that was expected to fail, and did.
    fn add_expected_failure(
        &mut self,
        test_id: &TestId,
        failure: NormalizedFailure,
        reason: Option<String>,
    );

    /// Records a test that was expected to fail, but passed.
    fn add_unexpected_success(&mut self, test_id: &TestId, reason: Option<String>);
}

/// A [`ResultAggregator`] that keeps everything it is given.
#[derive(Clone, Debug, Default)]
pub struct CollectedResults {
    /// Passing tests.
    pub successes: Vec<TestId>,

    /// Tests that errored.
    pub errors: Vec<(TestId, NormalizedFailure)>,

    /// Tests that failed an assertion.
    pub failures: Vec<(TestId, NormalizedFailure)>,

    /// Skipped tests and the reason they were skipped.
    pub skips: Vec<(TestId, String)>,

    /// Tests that failed as expected.
    pub expected_failures: Vec<(TestId, NormalizedFailure, Option<String>)>,

    /// Tests that passed while expected to fail.
    pub unexpected_successes: Vec<(TestId, Option<String>)>,
}

impl CollectedResults {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of outcomes of each kind.
    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            successes: self.successes.len(),
            errors: self.errors.len(),
            failures: self.failures.len(),
            skips: self.skips.len(),
            expected_failures: self.expected_failures.len(),
            unexpected_successes: self.unexpected_successes.len(),
        }
    }

    /// Returns true if no test errored, failed, or unexpectedly passed.
    pub fn was_successful(&self) -> bool {
        self.errors.is_empty() && self.failures.is_empty() && self.unexpected_successes.is_empty()
    }
}

impl ResultAggregator for CollectedResults {
    fn add_success(&mut self, test_id: &TestId) {
        self.successes.push(test_id.clone());
    }

    fn add_error(&mut self, test_id: &TestId, failure: NormalizedFailure) {
        self.errors.push((test_id.clone(), failure));
    }

    fn add_failure(&mut self, test_id: &TestId, failure: NormalizedFailure) {
        self.failures.push((test_id.clone(), failure));
    }

    fn add_skip(&mut self, test_id: &TestId, reason: String) {
        self.skips.push((test_id.clone(), reason));
    }

    fn add_expected_failure(
        &mut self,
        test_id: &TestId,
        failure: NormalizedFailure,
        reason: Option<String>,
    ) {
        self.expected_failures
            .push((test_id.clone(), failure, reason));
    }

    fn add_unexpected_success(&mut self, test_id: &TestId, reason: Option<String>) {
        self.unexpected_successes.push((test_id.clone(), reason));
    }
}

/// The number of outcomes of each kind.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Passing tests.
    pub successes: usize,

    /// Tests that errored.
    pub errors: usize,

    /// Tests that failed an assertion.
    pub failures: usize,

    /// Skipped tests.
    pub skips: usize,

    /// Tests that failed as expected.
    pub expected_failures: usize,

    /// Tests that passed while expected to fail.
    pub unexpected_successes: usize,
}

impl OutcomeCounts {
    /// Returns a count with a single outcome of the given kind.
    pub fn single(kind: OutcomeKind) -> Self {
        let mut counts = Self::default();
        *counts.get_mut(kind) += 1;
        counts
    }

    /// Returns the count for the given kind.
    pub fn get(&self, kind: OutcomeKind) -> usize {
        match kind {
            OutcomeKind::Success => self.successes,
            OutcomeKind::Error => self.errors,
            OutcomeKind::Failure => self.failures,
            OutcomeKind::Skip => self.skips,
            OutcomeKind::ExpectedFailure => self.expected_failures,
            OutcomeKind::UnexpectedSuccess => self.unexpected_successes,
        }
    }

    fn get_mut(&mut self, kind: OutcomeKind) -> &mut usize {
        match kind {
            OutcomeKind::Success => &mut self.successes,
            OutcomeKind::Error => &mut self.errors,
            OutcomeKind::Failure => &mut self.failures,
            OutcomeKind::Skip => &mut self.skips,
            OutcomeKind::ExpectedFailure => &mut self.expected_failures,
            OutcomeKind::UnexpectedSuccess => &mut self.unexpected_successes,
        }
    }

    /// Returns the total number of outcomes.
    pub fn total(&self) -> usize {
        OutcomeKind::ALL.into_iter().map(|kind| self.get(kind)).sum()
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errored, {} skipped, \
             {} expected failures, {} unexpected successes",
            self.successes,
            self.failures,
            self.errors,
            self.skips,
            self.expected_failures,
            self.unexpected_successes,
        )
    }
}

/// A [`ResultAggregator`] shared between worker sessions.
///
/// The lock is held for a single recording call at a time.
#[derive(Debug)]
pub struct SharedAggregator<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> Clone for SharedAggregator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> SharedAggregator<A> {
    /// Wraps an aggregator.
    pub fn new(aggregator: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(aggregator)),
        }
    }

    /// Runs `f` with exclusive access to the aggregator.
    ///
    /// A panic in an earlier recording call doesn't prevent later ones.
    pub fn record<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Returns the aggregator if this is the last handle to it.
    pub fn try_into_inner(self) -> Result<A, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(inner) => Err(Self { inner }),
        }
    }
}

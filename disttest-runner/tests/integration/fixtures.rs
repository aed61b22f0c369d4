// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::eyre::{Result, eyre};
use disttest_runner::{
    aggregator::{CollectedResults, SharedAggregator},
    config::{ControllerConfig, DistConfig},
    controller::{Controller, RunSummary, WorkerId, WorkerSession},
    errors::{HostError, RunTestError},
    reporter::{CapturedFailure, OutcomeReporter, RawExcInfo},
    transport::{FrameReader, FrameWriter},
    worker::{TestFramework, WorkerHost},
};
use disttest_wire::{ControllerMessage, TestId, WorkerMessage};
use std::{backtrace::Backtrace, collections::BTreeMap, future::Future, io, sync::Once};
use thiserror::Error;
use tokio::{
    io::{BufReader, DuplexStream, ReadHalf, WriteHalf, duplex, split},
    task::JoinHandle,
};

pub(crate) type SessionReader = BufReader<ReadHalf<DuplexStream>>;
pub(crate) type SessionWriter = WriteHalf<DuplexStream>;
pub(crate) type Session = WorkerSession<SessionReader, SessionWriter>;

const DUPLEX_BUFFER: usize = 64 * 1024;

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().expect("color-eyre installed once");
    });
}

/// Runs a future to completion on a fresh current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime built")
        .block_on(future)
}

/// An assertion failure, as a test framework would report it.
#[derive(Debug, Error)]
#[error("assertion failed: `left == right` (left: {left}, right: {right})")]
pub(crate) struct AssertionFailed {
    pub(crate) left: i64,
    pub(crate) right: i64,
}

/// What a fixture test does when run.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Behavior {
    Pass,
    AssertionFailure { structured: bool },
    Error { structured: bool },
    Skip(&'static str),
    ExpectedFailure(Option<&'static str>),
    UnexpectedSuccess(Option<&'static str>),
    NoOutcome,
    Panic(&'static str),
    SetupError,
}

pub(crate) fn connection_refused() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
}

pub(crate) fn assertion_failed() -> AssertionFailed {
    AssertionFailed { left: 1, right: 2 }
}

/// A test framework whose tests behave as scripted.
#[derive(Clone, Debug, Default)]
pub(crate) struct FixtureFramework {
    tests: BTreeMap<TestId, Behavior>,
}

impl FixtureFramework {
    pub(crate) fn new<'a>(tests: impl IntoIterator<Item = (&'a str, Behavior)>) -> Self {
        Self {
            tests: tests
                .into_iter()
                .map(|(name, behavior)| (TestId::new(name), behavior))
                .collect(),
        }
    }

    pub(crate) fn test_ids(&self) -> Vec<TestId> {
        self.tests.keys().cloned().collect()
    }
}

impl TestFramework for FixtureFramework {
    fn run_test(
        &self,
        test_id: &TestId,
        reporter: &mut dyn OutcomeReporter,
    ) -> Result<(), RunTestError> {
        let behavior = *self
            .tests
            .get(test_id)
            .ok_or_else(|| RunTestError::NotFound {
                test_id: test_id.clone(),
            })?;

        if let Behavior::SetupError = behavior {
            return Err(RunTestError::Setup {
                test_id: test_id.clone(),
                error: "fixture database unavailable".into(),
            });
        }

        reporter.start_test(test_id)?;
        match behavior {
            Behavior::Pass => reporter.add_success(test_id)?,
            Behavior::AssertionFailure { structured: true } => {
                let failure = CapturedFailure::capture_with_traceback(
                    &assertion_failed(),
                    &Backtrace::disabled(),
                );
                reporter.add_failure(test_id, (&failure).into())?;
            }
            Behavior::AssertionFailure { structured: false } => {
                let error = assertion_failed();
                reporter.add_failure(test_id, RawExcInfo::from_error(&error).into())?;
            }
            Behavior::Error { structured: true } => {
                let failure = CapturedFailure::capture_with_traceback(
                    &connection_refused(),
                    &Backtrace::disabled(),
                );
                reporter.add_error(test_id, (&failure).into())?;
            }
            Behavior::Error { structured: false } => {
                let error = connection_refused();
                reporter.add_error(test_id, RawExcInfo::from_error(&error).into())?;
            }
            Behavior::Skip(reason) => reporter.add_skip(test_id, reason)?,
            Behavior::ExpectedFailure(reason) => {
                let error = assertion_failed();
                let exc_info = RawExcInfo::from_error(&error).into();
                reporter.add_expected_failure(test_id, exc_info, reason)?;
            }
            Behavior::UnexpectedSuccess(reason) => {
                reporter.add_unexpected_success(test_id, reason)?;
            }
            Behavior::NoOutcome => {}
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::SetupError => unreachable!("handled above"),
        }
        reporter.stop_test(test_id)?;
        Ok(())
    }
}

/// Starts a worker host on the current runtime, returning the controller's
/// session for it.
pub(crate) fn spawn_worker(
    index: usize,
    framework: FixtureFramework,
) -> (Session, JoinHandle<Result<(), HostError>>) {
    let (controller_end, worker_end) = duplex(DUPLEX_BUFFER);
    let (worker_read, worker_write) = split(worker_end);
    let host = WorkerHost::new(framework, DistConfig::default_config().worker);
    let handle =
        tokio::spawn(async move { host.serve(BufReader::new(worker_read), worker_write).await });

    let (read, write) = split(controller_end);
    let session = WorkerSession::new(WorkerId::new(index), BufReader::new(read), write);
    (session, handle)
}

pub(crate) fn controller_config() -> ControllerConfig {
    DistConfig::default_config().controller
}

pub(crate) fn new_controller(
    config: ControllerConfig,
) -> (Controller<CollectedResults>, SharedAggregator<CollectedResults>) {
    let aggregator = SharedAggregator::new(CollectedResults::new());
    (Controller::new(aggregator.clone(), config), aggregator)
}

pub(crate) fn into_results(
    aggregator: SharedAggregator<CollectedResults>,
) -> Result<CollectedResults> {
    aggregator
        .try_into_inner()
        .map_err(|_| eyre!("aggregator still shared"))
}

/// Runs every test in `framework` on `workers` real worker hosts.
pub(crate) async fn run_fixture(
    framework: FixtureFramework,
    workers: usize,
) -> Result<(CollectedResults, RunSummary)> {
    let (controller, aggregator) = new_controller(controller_config());
    let (sessions, handles): (Vec<_>, Vec<_>) = (0..workers)
        .map(|index| spawn_worker(index, framework.clone()))
        .unzip();

    let summary = controller.run_tests(sessions, framework.test_ids()).await;
    for handle in handles {
        handle.await??;
    }
    drop(controller);
    Ok((into_results(aggregator)?, summary))
}

/// The worker end of a connection, driven by hand.
pub(crate) struct FakeWorker {
    reader: FrameReader<SessionReader>,
    writer: FrameWriter<SessionWriter>,
}

pub(crate) fn fake_worker(index: usize) -> (Session, FakeWorker) {
    let (controller_end, worker_end) = duplex(DUPLEX_BUFFER);
    let (read, write) = split(controller_end);
    let session = WorkerSession::new(WorkerId::new(index), BufReader::new(read), write);

    let (read, write) = split(worker_end);
    let fake = FakeWorker {
        reader: FrameReader::new(BufReader::new(read)),
        writer: FrameWriter::new(write),
    };
    (session, fake)
}

impl FakeWorker {
    pub(crate) async fn recv(&mut self) -> Result<ControllerMessage> {
        let message = self
            .reader
            .next_controller_message()
            .await?
            .ok_or_else(|| eyre!("controller closed the connection"))??;
        Ok(message)
    }

    pub(crate) async fn expect_run(&mut self) -> Result<TestId> {
        match self.recv().await? {
            ControllerMessage::Run { command } => Ok(command.test_id),
            other => Err(eyre!("expected a run command, got {other:?}")),
        }
    }

    pub(crate) async fn expect_ack(&mut self) -> Result<u64> {
        match self.recv().await? {
            ControllerMessage::Ack { seq } => Ok(seq),
            other => Err(eyre!("expected an ack, got {other:?}")),
        }
    }

    pub(crate) async fn expect_shutdown(&mut self) -> Result<()> {
        match self.recv().await? {
            ControllerMessage::Shutdown => Ok(()),
            other => Err(eyre!("expected shutdown, got {other:?}")),
        }
    }

    pub(crate) async fn send(&mut self, message: WorkerMessage) -> Result<()> {
        self.writer.send_worker_message(&message).await?;
        Ok(())
    }

    pub(crate) async fn send_raw(&mut self, frame: &str) -> Result<()> {
        self.writer.write_frame(frame).await?;
        Ok(())
    }

    pub(crate) async fn send_bytes(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_frame_bytes(frame).await?;
        Ok(())
    }
}

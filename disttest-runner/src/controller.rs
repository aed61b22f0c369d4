// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller side of disttest.
//!
//! A [`Controller`] hands tests out to a set of [`WorkerSession`]s, one test
//! per worker at a time, and replays every outcome they report into a single
//! shared [`ResultAggregator`] through a [`ResultSink`].

mod session;
mod sink;

pub use session::*;
pub use sink::*;

use crate::{
    aggregator::{ErrorClassRegistry, ResultAggregator, SharedAggregator},
    config::ControllerConfig,
    errors::{DisplayErrorChain, ProtocolViolation, WorkerSessionError},
    helpers::plural,
};
use disttest_wire::TestId;
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Identifies a worker within a controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Creates a new worker id.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the index this id was created with.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Runs tests across a set of workers.
#[derive(Debug)]
pub struct Controller<A> {
    sink: ResultSink<A>,
    config: ControllerConfig,
}

impl<A: ResultAggregator> Controller<A> {
    /// Creates a controller that records into `aggregator`, resolving error
    /// classes with a registry built from `config`.
    pub fn new(aggregator: SharedAggregator<A>, config: ControllerConfig) -> Self {
        let registry = ErrorClassRegistry::from_config(&config);
        Self::with_registry(aggregator, registry, config)
    }

    /// Creates a controller with a custom error class registry.
    pub fn with_registry(
        aggregator: SharedAggregator<A>,
        registry: ErrorClassRegistry,
        config: ControllerConfig,
    ) -> Self {
        Self {
            sink: ResultSink::new(aggregator, Arc::new(registry)),
            config,
        }
    }

    /// Returns the sink outcomes are recorded through.
    pub fn sink(&self) -> &ResultSink<A> {
        &self.sink
    }

    /// Runs `tests` on `workers`, returning once every test has an outcome or
    /// no workers are left.
    ///
    /// Workers pull tests from a shared queue, so tests left behind by a lost
    /// worker are picked up by the others. Each worker is sent a shutdown
    /// message once the queue is empty. Sessions are given the configured run
    /// timeout.
    pub async fn run_tests<R, W>(
        &self,
        workers: Vec<WorkerSession<R, W>>,
        tests: impl IntoIterator<Item = TestId>,
    ) -> RunSummary
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let queue = Mutex::new(tests.into_iter().collect::<VecDeque<_>>());
        let worker_count = workers.len();
        info!(
            "running {} {} on {worker_count} {}",
            queue_len(&queue),
            plural::tests_str(queue_len(&queue)),
            plural::workers_str(worker_count),
        );

        let reports = futures::future::join_all(
            workers
                .into_iter()
                .map(|session| self.drive_worker(session, &queue)),
        )
        .await;

        let mut summary = RunSummary {
            workers: worker_count,
            ..RunSummary::default()
        };
        for report in reports {
            summary.runs.extend(report.runs);
            summary.violations.extend(report.violations);
            summary.lost_workers.extend(report.error);
        }
        summary.not_run = queue
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into();
        if !summary.not_run.is_empty() {
            warn!(
                "{} {} not run: no workers left",
                summary.not_run.len(),
                plural::tests_str(summary.not_run.len()),
            );
        }
        info!("{summary}");
        summary
    }

    async fn drive_worker<R, W>(
        &self,
        session: WorkerSession<R, W>,
        queue: &Mutex<VecDeque<TestId>>,
    ) -> WorkerReport
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let worker = session.id();
        let mut session = session.with_run_timeout(self.config.run_timeout);
        let mut report = WorkerReport::default();

        loop {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(test_id) = next else {
                break;
            };

            let res = session.run_test(&test_id, &self.sink).await;
            report.violations.extend(session.take_violations());
            match res {
                Ok(run) => report.runs.push(run),
                Err(error) => {
                    warn!("{}", DisplayErrorChain::new(&error));
                    report.error = Some(error);
                    return report;
                }
            }
        }

        debug!(%worker, "no tests left");
        if let Err(error) = session.shutdown().await {
            warn!(%worker, "failed to shut down: {}", DisplayErrorChain::new(error));
        }
        report
    }
}

fn queue_len(queue: &Mutex<VecDeque<TestId>>) -> usize {
    queue.lock().unwrap_or_else(PoisonError::into_inner).len()
}

#[derive(Debug, Default)]
struct WorkerReport {
    runs: Vec<TestRun>,
    violations: Vec<ProtocolViolation>,
    error: Option<WorkerSessionError>,
}

/// What happened during [`Controller::run_tests`].
///
/// Test outcomes themselves are recorded in the aggregator. This covers
/// everything else.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// The number of workers the run started with.
    pub workers: usize,

    /// Tests that ran to completion on a worker.
    pub runs: Vec<TestRun>,

    /// Workers that were lost, with the error that ended each one. The test
    /// each was running has an error outcome.
    pub lost_workers: Vec<WorkerSessionError>,

    /// Messages from workers that were rejected.
    pub violations: Vec<ProtocolViolation>,

    /// Tests that were never dispatched because every worker was lost.
    pub not_run: Vec<TestId>,
}

impl RunSummary {
    /// Returns the number of tests that were given a terminal outcome.
    pub fn tests_finished(&self) -> usize {
        self.runs.len() + self.lost_workers.len()
    }

    /// Returns true if every test ran, every worker survived, and no
    /// messages were rejected.
    pub fn is_clean(&self) -> bool {
        self.lost_workers.is_empty()
            && self.violations.is_empty()
            && self.not_run.is_empty()
            && self.runs.iter().all(|run| run.run_success)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let finished = self.tests_finished();
        write!(
            f,
            "finished {finished} {} on {} {}",
            plural::tests_str(finished),
            self.workers,
            plural::workers_str(self.workers),
        )?;
        if !self.lost_workers.is_empty() {
            write!(
                f,
                ", {} {} lost",
                self.lost_workers.len(),
                plural::workers_str(self.lost_workers.len()),
            )?;
        }
        if !self.violations.is_empty() {
            write!(
                f,
                ", {} protocol {}",
                self.violations.len(),
                plural::violations_str(self.violations.len()),
            )?;
        }
        if !self.not_run.is_empty() {
            write!(
                f,
                ", {} {} not run",
                self.not_run.len(),
                plural::tests_str(self.not_run.len()),
            )?;
        }
        Ok(())
    }
}

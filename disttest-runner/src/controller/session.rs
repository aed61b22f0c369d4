// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ResultSink, WorkerId};
use crate::{
    aggregator::{ResultAggregator, synthesized},
    errors::{
        DisplayErrorChain, ProtocolViolation, ProtocolViolationKind, TransportError,
        WorkerSessionError,
    },
    transport::{FrameReader, FrameWriter},
};
use disttest_wire::{
    ControllerMessage, DecodeError, OutcomeKind, RunCommand, RunResult, TestId, WorkerMessage,
};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, error};

/// A completed run of one test on one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestRun {
    /// The test that was run.
    pub test_id: TestId,

    /// The terminal outcome that was recorded. If the worker didn't report
    /// one, this is the error disttest recorded in its place.
    pub outcome: OutcomeKind,

    /// The worker's [`RunResult::success`].
    pub run_success: bool,
}

/// The controller's end of a connection to one worker.
///
/// Runs one test at a time. The connection itself must already be
/// established.
#[derive(Debug)]
pub struct WorkerSession<R, W> {
    id: WorkerId,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    run_timeout: Option<Duration>,
    violations: Vec<ProtocolViolation>,
}

/// What is known about the test in flight.
struct InFlight<'a> {
    test_id: &'a TestId,
    recorded: Option<OutcomeKind>,
    desynchronized: bool,
}

impl<R, W> WorkerSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a session over an established connection.
    pub fn new(id: WorkerId, reader: R, writer: W) -> Self {
        Self {
            id,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            run_timeout: None,
            violations: Vec::new(),
        }
    }

    /// Sets how long to wait for each test to finish. `None` waits until the
    /// connection closes.
    pub fn with_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Returns this session's worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Takes the protocol violations seen so far.
    pub fn take_violations(&mut self) -> Vec<ProtocolViolation> {
        std::mem::take(&mut self.violations)
    }

    /// Runs `test_id` on the worker, recording its outcome into `sink`.
    ///
    /// Exactly one terminal outcome is recorded for the test, whether this
    /// returns `Ok` or `Err`. An error means the session can't be used any
    /// more.
    pub async fn run_test<A: ResultAggregator>(
        &mut self,
        test_id: &TestId,
        sink: &ResultSink<A>,
    ) -> Result<TestRun, WorkerSessionError> {
        debug!(worker = %self.id, %test_id, "dispatching test");
        let mut run = InFlight {
            test_id,
            recorded: None,
            desynchronized: false,
        };

        let res = self.run_test_impl(&mut run, sink).await;
        match res {
            Ok(result) => {
                let outcome = match run.recorded {
                    Some(outcome) => outcome,
                    None => {
                        let (class, text) = if run.desynchronized {
                            (
                                synthesized::DESYNCHRONIZED,
                                format!(
                                    "{} sent outcomes for other tests while running `{test_id}`",
                                    self.id,
                                ),
                            )
                        } else {
                            (
                                synthesized::NO_OUTCOME,
                                format!(
                                    "{} finished `{test_id}` without reporting an outcome",
                                    self.id,
                                ),
                            )
                        };
                        self.violation(Some(test_id), ProtocolViolationKind::MissingOutcome);
                        sink.synthesize_error(test_id, class, text);
                        OutcomeKind::Error
                    }
                };
                Ok(TestRun {
                    test_id: test_id.clone(),
                    outcome,
                    run_success: result.success,
                })
            }
            Err(error) => {
                if run.recorded.is_none() {
                    let class = match &error {
                        WorkerSessionError::Send { .. }
                        | WorkerSessionError::Disconnected { .. } => synthesized::WORKER_LOST,
                        WorkerSessionError::Timeout { .. } => synthesized::RUN_TIMEOUT,
                        WorkerSessionError::Desynchronized { .. } => synthesized::DESYNCHRONIZED,
                    };
                    let text = DisplayErrorChain::new(&error).to_string();
                    sink.synthesize_error(test_id, class, text);
                }
                Err(error)
            }
        }
    }

    async fn run_test_impl<A: ResultAggregator>(
        &mut self,
        run: &mut InFlight<'_>,
        sink: &ResultSink<A>,
    ) -> Result<RunResult, WorkerSessionError> {
        let command = ControllerMessage::Run {
            command: RunCommand {
                test_id: run.test_id.clone(),
            },
        };
        self.writer
            .send_controller_message(&command)
            .await
            .map_err(|error| WorkerSessionError::Send {
                worker: self.id,
                test_id: run.test_id.clone(),
                error,
            })?;

        match self.run_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_until_finished(run, sink))
                .await
                .unwrap_or_else(|_| {
                    Err(WorkerSessionError::Timeout {
                        worker: self.id,
                        test_id: run.test_id.clone(),
                        timeout,
                    })
                }),
            None => self.read_until_finished(run, sink).await,
        }
    }

    async fn read_until_finished<A: ResultAggregator>(
        &mut self,
        run: &mut InFlight<'_>,
        sink: &ResultSink<A>,
    ) -> Result<RunResult, WorkerSessionError> {
        let disconnected = |worker, error| WorkerSessionError::Disconnected {
            worker,
            test_id: run.test_id.clone(),
            error,
        };

        loop {
            let message = match self.reader.next_worker_message().await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(error))) => {
                    self.reject_frame(run.test_id, error)
                        .await
                        .map_err(|error| disconnected(self.id, Some(error)))?;
                    continue;
                }
                Ok(None) => return Err(disconnected(self.id, None)),
                Err(error) => return Err(disconnected(self.id, Some(error))),
            };

            match message {
                WorkerMessage::TestStarted { test_id } => {
                    self.check_lifecycle(run, "test-started", test_id);
                }
                WorkerMessage::TestStopped { test_id } => {
                    self.check_lifecycle(run, "test-stopped", test_id);
                }
                WorkerMessage::Outcome { seq, outcome } => {
                    if *outcome.test_id() != *run.test_id {
                        run.desynchronized = true;
                        self.violation(
                            Some(run.test_id),
                            ProtocolViolationKind::UnexpectedTest {
                                message_type: "outcome",
                                actual: outcome.test_id().clone(),
                            },
                        );
                    } else if let Some(previous) = run.recorded {
                        self.violation(
                            Some(run.test_id),
                            ProtocolViolationKind::DuplicateOutcome {
                                previous,
                                attempted: outcome.kind(),
                            },
                        );
                    } else {
                        run.recorded = Some(outcome.kind());
                        sink.dispatch(outcome);
                    }
                    self.ack(seq)
                        .await
                        .map_err(|error| disconnected(self.id, Some(error)))?;
                }
                WorkerMessage::RunFinished { result } => {
                    if result.test_id != *run.test_id {
                        return Err(WorkerSessionError::Desynchronized {
                            worker: self.id,
                            expected: run.test_id.clone(),
                            actual: result.test_id,
                        });
                    }
                    debug!(
                        worker = %self.id,
                        test_id = %result.test_id,
                        success = result.success,
                        "run finished",
                    );
                    return Ok(result);
                }
            }
        }
    }

    fn check_lifecycle(&mut self, run: &InFlight<'_>, message_type: &'static str, test_id: TestId) {
        if test_id == *run.test_id {
            debug!(worker = %self.id, %test_id, "{message_type}");
        } else {
            self.violation(
                Some(run.test_id),
                ProtocolViolationKind::UnexpectedTest {
                    message_type,
                    actual: test_id,
                },
            );
        }
    }

    /// Sends a shutdown message and closes the connection.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        debug!(worker = %self.id, "shutting down");
        self.writer
            .send_controller_message(&ControllerMessage::Shutdown)
            .await?;
        self.writer.shutdown().await
    }

    async fn ack(&mut self, seq: u64) -> Result<(), TransportError> {
        self.writer
            .send_controller_message(&ControllerMessage::Ack { seq })
            .await
    }

    /// Records an undecodable frame, acknowledging it if it had a sequence
    /// number so the worker isn't left waiting.
    async fn reject_frame(
        &mut self,
        in_flight: &TestId,
        error: DecodeError,
    ) -> Result<(), TransportError> {
        let seq = error.seq();
        self.violation(Some(in_flight), ProtocolViolationKind::Decode(error));
        match seq {
            Some(seq) => self.ack(seq).await,
            None => Ok(()),
        }
    }

    fn violation(&mut self, in_flight: Option<&TestId>, kind: ProtocolViolationKind) {
        let violation = ProtocolViolation {
            worker: self.id,
            in_flight: in_flight.cloned(),
            kind,
        };
        error!("{}", DisplayErrorChain::new(&violation));
        self.violations.push(violation);
    }
}

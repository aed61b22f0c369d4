// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker side of a disttest connection.
//!
//! A [`WorkerHost`] reads run commands from the controller and drives each
//! test through a [`TestFramework`] on a blocking thread. Reporting calls made
//! by the framework block until their frame has been written. Once the test
//! returns, the host waits for the controller to acknowledge every outcome
//! before sending the run result.

use crate::{
    aggregator::synthesized,
    config::WorkerConfig,
    errors::{DisplayErrorChain, HostError, ReportError, RunTestError, TransportError},
    reporter::{EventSink, ExcInfo, OutcomeReporter, RawExcInfo, ReporterEvent, WorkerReporter},
    transport::{FrameReader, FrameWriter},
};
use disttest_wire::{
    ControllerMessage, DecodeError, FailureSummary, OutcomeKind, RunResult, TestId, WorkerMessage,
};
use std::{
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, warn};

/// A test framework that can run a single test by name.
///
/// Implementations are called on a blocking thread, one test at a time, and
/// report through the given [`OutcomeReporter`].
pub trait TestFramework: Send + Sync + 'static {
    /// Runs `test_id`, reporting its outcome to `reporter`.
    ///
    /// If this returns without reporting a terminal outcome, whether or not
    /// it returned an error, the host reports an error outcome on its behalf.
    fn run_test(
        &self,
        test_id: &TestId,
        reporter: &mut dyn OutcomeReporter,
    ) -> Result<(), RunTestError>;
}

/// Serves run commands from a controller.
#[derive(Debug)]
pub struct WorkerHost<F> {
    framework: Arc<F>,
    config: WorkerConfig,
}

impl<F: TestFramework> WorkerHost<F> {
    /// Creates a new host for `framework`.
    pub fn new(framework: F, config: WorkerConfig) -> Self {
        Self {
            framework: Arc::new(framework),
            config,
        }
    }

    /// Serves the controller over this process's stdin and stdout.
    pub async fn serve_stdio(&self) -> Result<(), HostError> {
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serves the controller over the given streams.
    ///
    /// Returns once the controller sends a shutdown message or closes its
    /// side of the connection.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), HostError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut conn = HostConnection {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            control: ControlState::default(),
            next_seq: 0,
        };

        loop {
            if conn.control.shutdown_requested {
                debug!("controller requested shutdown");
                return Ok(());
            }
            if let Some(test_id) = conn.control.pending_run.take() {
                self.run_one(&mut conn, test_id).await?;
                continue;
            }
            if conn.control.closed {
                debug!("controller closed the connection");
                return Ok(());
            }

            match conn.reader.next_controller_message().await? {
                Some(message) => conn.control.handle_message(message),
                None => conn.control.closed = true,
            }
        }
    }

    async fn run_one<R, W>(
        &self,
        conn: &mut HostConnection<R, W>,
        test_id: TestId,
    ) -> Result<(), HostError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!(%test_id, "running test");

        let (sender, mut receiver) = mpsc::channel(self.config.event_buffer.max(1));
        let framework = self.framework.clone();
        let max_error_text_bytes = self.config.max_error_text_bytes;
        let thread_test_id = test_id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_framework(
                &*framework,
                thread_test_id,
                HostSink { sender },
                max_error_text_bytes,
            )
        });

        // A failed write ends the connection, but the test thread still has
        // to be drained and joined first.
        let mut write_error: Option<TransportError> = None;
        let mut read_error: Option<TransportError> = None;
        loop {
            tokio::select! {
                event = receiver.recv() => {
                    let Some((event, written)) = event else {
                        break;
                    };
                    let res = match &write_error {
                        Some(error) => Err(error.clone()),
                        None => conn.write_event(event).await,
                    };
                    if let Err(error) = &res {
                        if error.is_fatal() && write_error.is_none() {
                            error!(%test_id, "{}", DisplayErrorChain::new(error));
                            write_error = Some(error.clone());
                        }
                    }
                    // The reporter may have given up waiting, which is fine.
                    let _ = written.send(res);
                }
                message = conn.reader.next_controller_message(), if !conn.control.closed => {
                    match message {
                        Ok(Some(message)) => conn.control.handle_message(message),
                        Ok(None) => conn.control.closed = true,
                        Err(error) => {
                            conn.control.closed = true;
                            read_error = Some(error);
                        }
                    }
                }
            }
        }

        let terminal = handle.await.map_err(|error| HostError::Join {
            test_id: test_id.clone(),
            error,
        })?;
        debug!(
            %test_id,
            "test finished with {}",
            terminal.map_or("no outcome", OutcomeKind::as_str),
        );

        if let Some(error) = read_error {
            return Err(error.into());
        }
        if conn.control.closed {
            // Nobody is left to send the run result to, so failed writes are
            // expected.
            return Ok(());
        }
        if let Some(error) = write_error {
            return Err(error.into());
        }

        let acks = tokio::time::timeout(self.config.ack_timeout, conn.await_acks());
        let success = match acks.await {
            Ok(res) => res?,
            Err(_) => {
                warn!(
                    %test_id,
                    "timed out after {:?} waiting for {} acknowledgments",
                    self.config.ack_timeout,
                    conn.control.outstanding.len(),
                );
                conn.control.outstanding.clear();
                false
            }
        };
        if conn.control.closed {
            return Ok(());
        }

        conn.writer
            .send_worker_message(&WorkerMessage::RunFinished {
                result: RunResult { test_id, success },
            })
            .await?;
        Ok(())
    }
}

/// The state of one connection to the controller.
struct HostConnection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    control: ControlState,
    next_seq: u64,
}

impl<R, W> HostConnection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn write_event(&mut self, event: ReporterEvent) -> Result<(), TransportError> {
        let message = match event {
            ReporterEvent::TestStarted { test_id } => WorkerMessage::TestStarted { test_id },
            ReporterEvent::TestStopped { test_id } => WorkerMessage::TestStopped { test_id },
            ReporterEvent::Outcome(outcome) => WorkerMessage::Outcome {
                seq: self.next_seq,
                outcome,
            },
        };
        self.writer.send_worker_message(&message).await?;
        if let WorkerMessage::Outcome { seq, .. } = message {
            self.control.outstanding.insert(seq);
            self.next_seq += 1;
        }
        Ok(())
    }

    /// Reads frames until every outstanding outcome has been acknowledged.
    ///
    /// Returns `Ok(false)` if the controller went away first.
    async fn await_acks(&mut self) -> Result<bool, TransportError> {
        while !self.control.outstanding.is_empty() {
            match self.reader.next_controller_message().await? {
                Some(message) => self.control.handle_message(message),
                None => {
                    self.control.closed = true;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// What the controller has asked for.
#[derive(Debug, Default)]
struct ControlState {
    outstanding: BTreeSet<u64>,
    pending_run: Option<TestId>,
    shutdown_requested: bool,
    closed: bool,
}

impl ControlState {
    fn handle_message(&mut self, message: Result<ControllerMessage, DecodeError>) {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                warn!("ignoring frame from controller: {}", DisplayErrorChain::new(&error));
                return;
            }
        };

        match message {
            ControllerMessage::Run { command } => {
                if let Some(pending) = &self.pending_run {
                    warn!(
                        "ignoring run command for `{}`: `{pending}` is already queued",
                        command.test_id,
                    );
                } else {
                    self.pending_run = Some(command.test_id);
                }
            }
            ControllerMessage::Ack { seq } => {
                if !self.outstanding.remove(&seq) {
                    debug!(seq, "ignoring acknowledgment for unknown sequence number");
                }
            }
            ControllerMessage::Shutdown => self.shutdown_requested = true,
        }
    }
}

type WrittenNotifier = oneshot::Sender<Result<(), TransportError>>;

/// Forwards reporter events from the test thread to the host.
struct HostSink {
    sender: mpsc::Sender<(ReporterEvent, WrittenNotifier)>,
}

impl EventSink for HostSink {
    fn send(&mut self, event: ReporterEvent) -> Result<(), ReportError> {
        let test_id = match &event {
            ReporterEvent::TestStarted { test_id } | ReporterEvent::TestStopped { test_id } => {
                test_id.clone()
            }
            ReporterEvent::Outcome(outcome) => outcome.test_id().clone(),
        };
        let (written, wait) = oneshot::channel();
        self.sender
            .blocking_send((event, written))
            .map_err(|_| ReportError::ChannelClosed {
                test_id: test_id.clone(),
            })?;
        match wait.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ReportError::Transport { test_id, error }),
            Err(_) => Err(ReportError::ChannelClosed { test_id }),
        }
    }
}

/// Runs one test on the current (blocking) thread and makes sure it ends
/// with a terminal outcome.
fn run_framework<F: TestFramework>(
    framework: &F,
    test_id: TestId,
    sink: HostSink,
    max_error_text_bytes: usize,
) -> Option<OutcomeKind> {
    let mut reporter = WorkerReporter::new(test_id.clone(), sink, max_error_text_bytes);
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        framework.run_test(&test_id, &mut reporter)
    }));

    let already_reported = reporter.terminal_outcome().is_some();
    let synthesized = match &res {
        Ok(Ok(())) if already_reported => None,
        Ok(Ok(())) => Some(FailureSummary::new(
            synthesized::NO_OUTCOME,
            format!("test `{test_id}` finished without reporting an outcome"),
        )),
        Ok(Err(error)) => {
            warn!(%test_id, "{}", DisplayErrorChain::new(error));
            (!already_reported).then(|| {
                FailureSummary::new(
                    synthesized::RUN_TEST_FAILED,
                    DisplayErrorChain::new(error).to_string(),
                )
            })
        }
        Err(payload) => {
            let raw = RawExcInfo::from_panic(&**payload);
            warn!(%test_id, "test framework panicked: {}", raw.value);
            (!already_reported).then(|| ExcInfo::Raw(raw).summarize(max_error_text_bytes))
        }
    };

    if let Some(failure) = synthesized {
        if let Err(error) = reporter.report_synthesized_error(failure) {
            error!(%test_id, "failed to report error outcome: {}", DisplayErrorChain::new(error));
        }
    }
    reporter.terminal_outcome()
}

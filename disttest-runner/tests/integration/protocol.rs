// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Controller behavior against workers that don't follow the protocol.

use crate::fixtures::*;
use color_eyre::eyre::Result;
use disttest_runner::{
    aggregator::{OutcomeCounts, synthesized},
    errors::{ProtocolViolationKind, WorkerSessionError},
};
use disttest_wire::{
    DecodeError, FailureSummary, OutcomeKind, OutcomeMessage, RunResult, TestId, WorkerMessage,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn outcome(seq: u64, outcome: OutcomeMessage) -> WorkerMessage {
    WorkerMessage::Outcome { seq, outcome }
}

fn run_finished(test_id: &TestId) -> WorkerMessage {
    WorkerMessage::RunFinished {
        result: RunResult {
            test_id: test_id.clone(),
            success: true,
        },
    }
}

#[tokio::test]
async fn disconnect_mid_test_records_one_error() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);
    let tests = vec![TestId::new("pkg::first"), TestId::new("pkg::second")];

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send(WorkerMessage::TestStarted { test_id }).await?;
        // Dropping the fake worker closes the connection.
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(controller.run_tests(vec![session], tests), worker);
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Error));
    let (test_id, failure) = &results.errors[0];
    assert_eq!(test_id.as_str(), "pkg::first");
    assert_eq!(failure.class().name(), synthesized::WORKER_LOST);
    assert_eq!(
        failure.text(),
        "worker-0 disconnected while running `pkg::first`"
    );

    assert_eq!(summary.lost_workers.len(), 1);
    assert!(matches!(
        summary.lost_workers[0],
        WorkerSessionError::Disconnected { error: None, .. }
    ));
    assert_eq!(summary.not_run, vec![TestId::new("pkg::second")]);
    Ok(())
}

#[tokio::test]
async fn lost_worker_leaves_tests_to_others() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (lost_session, mut fake) = fake_worker(0);
    let framework = FixtureFramework::new([
        ("pkg::a", Behavior::Pass),
        ("pkg::b", Behavior::Pass),
        ("pkg::c", Behavior::Pass),
    ]);
    let (good_session, handle) = spawn_worker(1, framework.clone());

    let worker = async move {
        // Take one test, then vanish.
        fake.expect_run().await?;
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![lost_session, good_session], framework.test_ids()),
        worker,
    );
    worker_res?;
    handle.await??;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts().total(), 3);
    assert_eq!(results.errors.len(), 1);
    assert_eq!(results.successes.len(), 2);
    assert_eq!(summary.lost_workers.len(), 1);
    assert!(summary.not_run.is_empty());
    assert_eq!(summary.tests_finished(), 3);
    Ok(())
}

#[tokio::test]
async fn unknown_kind_rejected_and_acked() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send_raw(&format!(
            r#"{{"type":"outcome","seq":0,"outcome":{{"kind":"exploded","test-id":"{test_id}"}}}}"#
        ))
        .await?;
        assert_eq!(fake.expect_ack().await?, 0);

        fake.send(outcome(
            1,
            OutcomeMessage::Success {
                test_id: test_id.clone(),
            },
        ))
        .await?;
        assert_eq!(fake.expect_ack().await?, 1);
        fake.send(run_finished(&test_id)).await?;
        fake.expect_shutdown().await?;
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![session], [TestId::new("pkg::case")]),
        worker,
    );
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Success));

    assert_eq!(summary.violations.len(), 1);
    let violation = &summary.violations[0];
    assert_eq!(violation.in_flight, Some(TestId::new("pkg::case")));
    assert!(
        matches!(
            &violation.kind,
            ProtocolViolationKind::Decode(DecodeError::UnknownOutcomeKind {
                kind: Some(kind),
                seq: Some(0),
            }) if kind == "exploded"
        ),
        "unexpected violation: {:?}",
        violation.kind,
    );
    Ok(())
}

#[tokio::test]
async fn mismatched_outcome_desynchronizes() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send(outcome(
            0,
            OutcomeMessage::Success {
                test_id: "pkg::other".into(),
            },
        ))
        .await?;
        assert_eq!(fake.expect_ack().await?, 0);
        fake.send(run_finished(&test_id)).await?;
        fake.expect_shutdown().await?;
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![session], [TestId::new("pkg::case")]),
        worker,
    );
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Error));
    let (test_id, failure) = &results.errors[0];
    assert_eq!(test_id.as_str(), "pkg::case");
    assert_eq!(failure.class().name(), synthesized::DESYNCHRONIZED);

    let kinds: Vec<_> = summary.violations.iter().map(|v| &v.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert!(matches!(
        kinds[0],
        ProtocolViolationKind::UnexpectedTest {
            message_type: "outcome",
            actual,
        } if actual.as_str() == "pkg::other"
    ));
    assert!(matches!(kinds[1], ProtocolViolationKind::MissingOutcome));
    Ok(())
}

#[tokio::test]
async fn duplicate_terminal_outcome_ignored() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send(outcome(
            0,
            OutcomeMessage::Success {
                test_id: test_id.clone(),
            },
        ))
        .await?;
        fake.send(outcome(
            1,
            OutcomeMessage::Failure {
                test_id: test_id.clone(),
                failure: FailureSummary::new("pkg::Late", "too late"),
            },
        ))
        .await?;
        assert_eq!(fake.expect_ack().await?, 0);
        assert_eq!(fake.expect_ack().await?, 1);
        fake.send(run_finished(&test_id)).await?;
        fake.expect_shutdown().await?;
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![session], [TestId::new("pkg::case")]),
        worker,
    );
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Success));
    assert_eq!(summary.violations.len(), 1);
    assert!(matches!(
        summary.violations[0].kind,
        ProtocolViolationKind::DuplicateOutcome {
            previous: OutcomeKind::Success,
            attempted: OutcomeKind::Failure,
        }
    ));
    Ok(())
}

#[tokio::test]
async fn run_finished_for_other_test() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        fake.expect_run().await?;
        fake.send(run_finished(&"pkg::other".into())).await?;
        // The controller drops this worker without a shutdown message.
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![session], [TestId::new("pkg::case")]),
        worker,
    );
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Error));
    assert_eq!(
        results.errors[0].1.class().name(),
        synthesized::DESYNCHRONIZED
    );
    assert!(matches!(
        summary.lost_workers[..],
        [WorkerSessionError::Desynchronized { .. }]
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_timeout_records_error() -> Result<()> {
    test_init();

    let mut config = controller_config();
    config.run_timeout = Some(Duration::from_secs(60));
    let (controller, aggregator) = new_controller(config);
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send(WorkerMessage::TestStarted { test_id }).await?;
        // Hold the connection open without ever finishing.
        std::future::pending::<()>().await;
        Result::<()>::Ok(())
    };
    let summary = tokio::select! {
        summary = controller.run_tests(vec![session], [TestId::new("pkg::slow")]) => summary,
        _ = worker => unreachable!("fake worker never finishes"),
    };
    drop(controller);

    let results = into_results(aggregator)?;
    let (_, failure) = &results.errors[0];
    assert_eq!(failure.class().name(), synthesized::RUN_TIMEOUT);
    assert_eq!(
        failure.text(),
        "worker-0 did not finish `pkg::slow` within 60s"
    );
    assert_eq!(summary.lost_workers.len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_frame_rejected_session_survives() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);
    let tests = vec![TestId::new("pkg::case"), TestId::new("pkg::next")];

    let worker = async move {
        for seq in 0..2 {
            let test_id = fake.expect_run().await?;
            fake.send_bytes(b"\xff\xfe garbage").await?;
            fake.send(outcome(
                seq,
                OutcomeMessage::Success {
                    test_id: test_id.clone(),
                },
            ))
            .await?;
            assert_eq!(fake.expect_ack().await?, seq);
            fake.send(run_finished(&test_id)).await?;
        }
        fake.expect_shutdown().await?;
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(controller.run_tests(vec![session], tests), worker);
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts().get(OutcomeKind::Success), 2);
    assert_eq!(results.counts().total(), 2);
    assert!(summary.lost_workers.is_empty());
    assert!(summary.not_run.is_empty());

    assert_eq!(summary.violations.len(), 2);
    for violation in &summary.violations {
        assert!(
            matches!(
                violation.kind,
                ProtocolViolationKind::Decode(DecodeError::InvalidUtf8(_))
            ),
            "unexpected violation: {:?}",
            violation.kind,
        );
    }
    Ok(())
}

#[tokio::test]
async fn disconnect_after_outcome_keeps_reported_outcome() -> Result<()> {
    test_init();

    let (controller, aggregator) = new_controller(controller_config());
    let (session, mut fake) = fake_worker(0);

    let worker = async move {
        let test_id = fake.expect_run().await?;
        fake.send(outcome(
            0,
            OutcomeMessage::Failure {
                test_id: test_id.clone(),
                failure: FailureSummary::new("pkg::Boom", "boom"),
            },
        ))
        .await?;
        assert_eq!(fake.expect_ack().await?, 0);
        // Gone before sending the run result.
        Result::<()>::Ok(())
    };
    let (summary, worker_res) = tokio::join!(
        controller.run_tests(vec![session], [TestId::new("pkg::case")]),
        worker,
    );
    worker_res?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Failure));
    let (test_id, failure) = &results.failures[0];
    assert_eq!(test_id.as_str(), "pkg::case");
    assert_eq!(failure.class().original_name(), "pkg::Boom");
    assert_eq!(failure.text(), "boom");

    assert!(matches!(
        summary.lost_workers[..],
        [WorkerSessionError::Disconnected { error: None, .. }]
    ));
    assert!(summary.violations.is_empty());
    assert!(summary.runs.is_empty());
    Ok(())
}

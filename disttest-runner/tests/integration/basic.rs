// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use disttest_runner::aggregator::{CollectedResults, ErrorClass, OutcomeCounts, synthesized};
use disttest_wire::OutcomeKind;
use pretty_assertions::assert_eq;
use std::{any::type_name, io};
use test_case::test_case;

fn run_single(behavior: Behavior) -> Result<CollectedResults> {
    let framework = FixtureFramework::new([("pkg::case", behavior)]);
    let (results, summary) = block_on(run_fixture(framework, 1))?;
    ensure!(summary.is_clean(), "run was not clean: {summary}");
    Ok(results)
}

#[test_case(Behavior::AssertionFailure { structured: true }, OutcomeKind::Failure; "A: assertion failure")]
#[test_case(Behavior::AssertionFailure { structured: false }, OutcomeKind::Failure; "A: assertion failure, raw")]
#[test_case(Behavior::Error { structured: false }, OutcomeKind::Error; "B: unrelated error")]
#[test_case(Behavior::Skip("requires network"), OutcomeKind::Skip; "C: skip")]
#[test_case(Behavior::ExpectedFailure(Some("issue 42")), OutcomeKind::ExpectedFailure; "D: expected failure")]
#[test_case(Behavior::UnexpectedSuccess(None), OutcomeKind::UnexpectedSuccess; "E: unexpected success")]
#[test_case(Behavior::Pass, OutcomeKind::Success; "F: success")]
fn one_outcome_per_test(behavior: Behavior, kind: OutcomeKind) -> Result<()> {
    test_init();

    let results = run_single(behavior)?;
    assert_eq!(results.counts(), OutcomeCounts::single(kind));
    Ok(())
}

#[test]
fn payloads_survive_the_trip() -> Result<()> {
    test_init();

    let framework = FixtureFramework::new([
        ("pkg::failure", Behavior::AssertionFailure { structured: true }),
        ("pkg::skip", Behavior::Skip("requires network")),
        ("pkg::xfail", Behavior::ExpectedFailure(Some(""))),
        ("pkg::xpass", Behavior::UnexpectedSuccess(Some("flaky on CI"))),
    ]);
    let (results, _) = block_on(run_fixture(framework, 1))?;

    let (test_id, failure) = &results.failures[0];
    assert_eq!(test_id.as_str(), "pkg::failure");
    assert_eq!(
        failure.to_string(),
        "assertion failed: `left == right` (left: 1, right: 2)"
    );
    assert_eq!(
        failure.class().original_name(),
        type_name::<AssertionFailed>()
    );

    assert_eq!(results.skips[0].1, "requires network");
    // An empty reason is still a reason.
    assert_eq!(results.expected_failures[0].2.as_deref(), Some(""));
    assert_eq!(
        results.unexpected_successes[0].1.as_deref(),
        Some("flaky on CI")
    );
    Ok(())
}

#[test]
fn raw_and_structured_capture_agree() -> Result<()> {
    test_init();

    let framework = FixtureFramework::new([
        ("pkg::raw", Behavior::Error { structured: false }),
        ("pkg::structured", Behavior::Error { structured: true }),
    ]);
    let (results, _) = block_on(run_fixture(framework, 1))?;
    assert_eq!(results.errors.len(), 2);

    let (_, raw) = &results.errors[0];
    let (_, structured) = &results.errors[1];
    assert_eq!(raw.class(), structured.class());
    assert_eq!(raw.class().name(), type_name::<io::Error>());
    assert!(raw.is::<io::Error>());
    assert_eq!(raw.text(), structured.text());
    assert_eq!(raw.text(), connection_refused().to_string());
    Ok(())
}

#[test]
fn raw_and_structured_failures_agree() -> Result<()> {
    test_init();

    let framework = FixtureFramework::new([
        ("pkg::raw", Behavior::AssertionFailure { structured: false }),
        ("pkg::structured", Behavior::AssertionFailure { structured: true }),
    ]);
    let (results, _) = block_on(run_fixture(framework, 1))?;
    assert_eq!(results.counts().get(OutcomeKind::Failure), 2);
    assert!(results.errors.is_empty(), "failures are not reclassified");

    let (raw_id, raw) = &results.failures[0];
    let (structured_id, structured) = &results.failures[1];
    assert_eq!(raw_id.as_str(), "pkg::raw");
    assert_eq!(structured_id.as_str(), "pkg::structured");
    assert_eq!(raw.class(), structured.class());
    assert_eq!(
        raw.class().original_name(),
        type_name::<AssertionFailed>()
    );
    assert_eq!(raw.text(), structured.text());
    assert_eq!(raw.text(), assertion_failed().to_string());
    Ok(())
}

#[test]
fn unknown_class_becomes_placeholder() -> Result<()> {
    test_init();

    let results = run_single(Behavior::AssertionFailure { structured: true })?;
    let (_, failure) = &results.failures[0];
    assert_eq!(
        failure.class(),
        &ErrorClass::Placeholder {
            placeholder: "disttest::UnresolvedError".into(),
            original: type_name::<AssertionFailed>().into(),
        }
    );
    assert!(!failure.is::<AssertionFailed>());
    Ok(())
}

#[test]
fn configured_class_is_known() -> Result<()> {
    test_init();

    let mut config = controller_config();
    config
        .known_error_classes
        .push(type_name::<AssertionFailed>().to_owned());
    let (controller, aggregator) = new_controller(config);
    let framework = FixtureFramework::new([(
        "pkg::case",
        Behavior::AssertionFailure { structured: true },
    )]);

    block_on(async {
        let (session, handle) = spawn_worker(0, framework.clone());
        controller
            .run_tests(vec![session], framework.test_ids())
            .await;
        handle.await??;
        Result::<()>::Ok(())
    })?;
    drop(controller);

    let results = into_results(aggregator)?;
    assert!(results.failures[0].1.is::<AssertionFailed>());
    Ok(())
}

#[test_case(Behavior::NoOutcome, synthesized::NO_OUTCOME; "no outcome reported")]
#[test_case(Behavior::SetupError, synthesized::RUN_TEST_FAILED; "framework returned an error")]
#[test_case(Behavior::Panic("fixture exploded"), type_name::<String>(); "framework panicked")]
fn worker_synthesizes_error(behavior: Behavior, class: &str) -> Result<()> {
    test_init();

    let results = run_single(behavior)?;
    assert_eq!(results.counts(), OutcomeCounts::single(OutcomeKind::Error));
    let (test_id, failure) = &results.errors[0];
    assert_eq!(test_id.as_str(), "pkg::case");
    assert_eq!(failure.class().name(), class);
    if let Behavior::Panic(message) = behavior {
        assert_eq!(failure.text(), message);
    }
    Ok(())
}

#[test]
fn many_workers_share_one_aggregator() -> Result<()> {
    test_init();

    let behaviors = [
        Behavior::Pass,
        Behavior::AssertionFailure { structured: true },
        Behavior::AssertionFailure { structured: false },
        Behavior::Error { structured: true },
        Behavior::Skip("not today"),
        Behavior::ExpectedFailure(None),
        Behavior::UnexpectedSuccess(None),
        Behavior::NoOutcome,
    ];
    let names: Vec<String> = (0..40).map(|i| format!("pkg::test_{i:02}")).collect();
    let framework = FixtureFramework::new(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), behaviors[i % behaviors.len()])),
    );

    let (results, summary) = block_on(run_fixture(framework, 4))?;
    ensure!(summary.is_clean(), "run was not clean: {summary}");
    assert_eq!(summary.tests_finished(), 40);
    assert_eq!(results.counts().total(), 40);

    // Every test shows up exactly once, whatever its outcome.
    let mut seen: Vec<String> = results
        .successes
        .iter()
        .chain(results.errors.iter().map(|(id, _)| id))
        .chain(results.failures.iter().map(|(id, _)| id))
        .chain(results.skips.iter().map(|(id, _)| id))
        .chain(results.expected_failures.iter().map(|(id, _, _)| id))
        .chain(results.unexpected_successes.iter().map(|(id, _)| id))
        .map(|id| id.as_str().to_owned())
        .collect();
    seen.sort();
    assert_eq!(seen, names);
    Ok(())
}

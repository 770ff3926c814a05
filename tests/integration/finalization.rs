//! Finalization tests.
//!
//! Publishing is idempotent: a rerun finds the artifact an earlier run
//! opened instead of opening another, and an archived plan is left alone.

use chrono::Utc;

use baton::core::TaskGraph;
use baton::docs::DocCandidate;
use baton::orchestration::{FinalizeOutcome, Finalizer, GateReport, RunStatus};
use baton::state::{RunPhase, RunRecord};
use baton::vcs::ChangeKind;
use baton::workspace::EnvironmentHandle;

use crate::fixtures::{changed, Harness, FAN_IN};

/// Test: Existing artifact is reused
/// Given a change artifact already carrying this plan's marker
/// When the plan finalizes
/// Then no second artifact is opened and the existing one is reported
#[tokio::test]
async fn test_existing_artifact_is_found_not_reopened() {
    let harness = Harness::new();
    harness
        .vcs
        .with_existing_artifact("https://example.test/pulls/41");
    let plan = harness.plan("fan-in", FAN_IN);

    let report = harness.orchestrator().run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Finalized);
    assert_eq!(report.artifact_url(), Some("https://example.test/pulls/41"));
    assert!(harness.vcs.opened().is_empty());
    let record = harness.store.load("fan-in").unwrap().unwrap();
    assert_eq!(record.artifact.as_deref(), Some("https://example.test/pulls/41"));
}

/// Test: Archived plan is a no-op
/// Given a plan that finalized
/// When it is run again
/// Then nothing is dispatched, created or published
#[tokio::test]
async fn test_second_run_of_archived_plan_does_nothing() {
    let harness = Harness::new();
    let plan = harness.plan("fan-in", FAN_IN);
    let first = harness.orchestrator().run(&plan).await.unwrap();
    assert_eq!(first.status, RunStatus::Finalized);
    let invoked = harness.runtime.invoked_tasks().len();

    let second = harness.orchestrator().run(&plan).await.unwrap();

    assert_eq!(second.status, RunStatus::AlreadyFinalized);
    assert_eq!(second.exit_code(), 0);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.finalize, Some(FinalizeOutcome::AlreadyFinalized));
    assert_eq!(second.summary.completed, 3);
    assert_eq!(harness.runtime.invoked_tasks().len(), invoked);
    assert_eq!(harness.vcs.worktrees_created(), 1);
    assert_eq!(harness.vcs.opened().len(), 1);
}

/// Test: Artifact recorded before a crash
/// Given a halted record that already holds the artifact URL
/// When the plan is run again
/// Then the recorded artifact is reported without touching the remote
#[tokio::test]
async fn test_recorded_artifact_skips_publishing() {
    let harness = Harness::new();
    let plan = harness.plan("fan-in", FAN_IN);
    let mut record = RunRecord::new("fan-in", plan.source.clone());
    record.phase = RunPhase::Halted;
    record.artifact = Some("https://example.test/pulls/7".to_string());
    harness.store.save(&record).unwrap();

    let report = harness.orchestrator().run(&plan).await.unwrap();

    assert_eq!(report.artifact_url(), Some("https://example.test/pulls/7"));
    assert!(harness.vcs.opened().is_empty());
    assert_eq!(harness.vcs.pushes(), 0);
}

/// Test: Documentation cascade
/// Given an advisory document that names a renamed path and a deleted one
/// When the plan finalizes
/// Then the rename is rewritten and pushed, and the deletion raises a follow-up
#[tokio::test]
async fn test_cascade_rewrites_renames_and_raises_follow_ups() {
    let harness = Harness::new();
    let plan = harness.plan("fan-in", FAN_IN);
    let root = harness.dir.path().join("env");
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(
        root.join("docs/guide.md"),
        "Start in src/old.rs.\nHelpers live in src/util/helpers.rs.\n",
    )
    .unwrap();
    let env = EnvironmentHandle {
        slug: plan.slug.clone(),
        root: root.clone(),
        branch: "baton/fan-in".to_string(),
        base_commit: "base".to_string(),
        created_at: Utc::now(),
    };
    let report = GateReport {
        advisory: vec![DocCandidate {
            path: "docs/guide.md".to_string(),
            score: 2,
            terms: vec!["old.rs".to_string(), "helpers.rs".to_string()],
        }],
        changed: vec![
            changed(
                "src/new.rs",
                ChangeKind::Renamed {
                    from: "src/old.rs".to_string(),
                },
            ),
            changed("src/util/helpers.rs", ChangeKind::Deleted),
        ],
        ..Default::default()
    };
    let graph = TaskGraph::from_plan(&plan).unwrap();
    let mut record = RunRecord::new(&plan.slug, plan.source.clone());
    let finalizer = Finalizer::new(
        harness.vcs.clone(),
        harness.tracker.clone(),
        harness.store.clone(),
        harness.archive_dir(),
    );

    let outcome = finalizer
        .finalize(&plan, &env, &graph, &report, &mut record)
        .await
        .unwrap();

    let cascade = match outcome {
        FinalizeOutcome::Finalized { cascade, .. } => cascade,
        other => panic!("unexpected: {other:?}"),
    };
    assert_eq!(cascade.edited, vec!["docs/guide.md".to_string()]);
    assert_eq!(cascade.follow_ups.len(), 1);
    assert_eq!(harness.tracker.follow_ups.lock().unwrap().len(), 1);

    let guide = std::fs::read_to_string(root.join("docs/guide.md")).unwrap();
    assert!(guide.contains("src/new.rs"));
    assert!(!guide.contains("src/old.rs"));
    assert_eq!(harness.vcs.pushes(), 2);
    assert!(harness
        .vcs
        .commits()
        .iter()
        .any(|c| c.contains("update documentation references")));

    assert!(record.archived);
    assert_eq!(record.phase, RunPhase::Finalized);

    let again = finalizer
        .finalize(&plan, &env, &graph, &report, &mut record)
        .await
        .unwrap();
    assert_eq!(again, FinalizeOutcome::AlreadyFinalized);
    assert_eq!(harness.vcs.opened().len(), 1);
}

/// Test: Tracking reference closed once
/// Given a plan with a tracking reference
/// When it is run twice
/// Then the reference is closed by the finalizing run only
#[tokio::test]
async fn test_tracker_is_closed_once() {
    let harness = Harness::new();
    let plan = harness.plan("fan-in", FAN_IN);
    let orchestrator = harness.orchestrator();

    orchestrator.run(&plan).await.unwrap();
    orchestrator.run(&plan).await.unwrap();

    assert_eq!(*harness.tracker.closed.lock().unwrap(), vec!["ENG-7".to_string()]);
}

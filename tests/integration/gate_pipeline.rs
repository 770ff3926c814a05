//! Gate pipeline tests.
//!
//! Hard gates run in order and stop at the first failure; the advisory
//! cross-reference scan overlaps them and never decides the outcome.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use baton::core::{TaskGraph, TaskId, TaskStatus};
use baton::docs::DocCandidate;
use baton::orchestration::gates::{BUILD, COMPLETION, CROSS_REFERENCE, DOCUMENTATION};
use baton::orchestration::{GatePipeline, GateReport};
use baton::plan::Plan;
use baton::vcs::ChangeKind;
use baton::workspace::EnvironmentHandle;

use crate::fixtures::{changed, FakeGates, FakeVcs};

const TWO_TASKS: &str = r#"
[[tasks]]
id = "A"

[[tasks]]
id = "B"
depends_on = ["A"]
"#;

fn env(dir: &TempDir) -> EnvironmentHandle {
    EnvironmentHandle {
        slug: "plan".to_string(),
        root: dir.path().to_path_buf(),
        branch: "baton/plan".to_string(),
        base_commit: "base".to_string(),
        created_at: Utc::now(),
    }
}

fn settled(plan: &Plan, fail: Option<&str>) -> TaskGraph {
    let mut graph = TaskGraph::from_plan(plan).unwrap();
    for task in plan.tasks.iter().map(|t| TaskId::from(t.id.as_str())) {
        if graph.get(&task).unwrap().status != TaskStatus::Pending {
            continue;
        }
        graph.transition(&task, TaskStatus::Ready).unwrap();
        graph.transition(&task, TaskStatus::InProgress).unwrap();
        if fail == Some(task.as_str()) {
            graph.fail(&task, "exit 1").unwrap();
            graph.block_dependents(&task);
        } else {
            graph.transition(&task, TaskStatus::Completed).unwrap();
        }
    }
    graph
}

async fn run(
    gates: FakeGates,
    vcs: Arc<FakeVcs>,
    plan: &Plan,
    graph: &TaskGraph,
    scan_timeout: Duration,
) -> (GateReport, Arc<FakeGates>, TempDir) {
    let dir = TempDir::new().unwrap();
    let gates = Arc::new(gates);
    let pipeline = GatePipeline::new(gates.clone(), vcs, scan_timeout);
    let report = pipeline.run(plan, &env(&dir), graph).await;
    (report, gates, dir)
}

fn names(report: &GateReport) -> Vec<&str> {
    report.results.iter().map(|r| r.name.as_str()).collect()
}

/// Test: Build failure short-circuits
/// Given all tasks completed and a failing build
/// When the pipeline runs
/// Then documentation is not checked and the running scan is aborted
#[tokio::test]
async fn test_build_failure_skips_the_rest() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::parse(TWO_TASKS, Path::new("plan.toml")).unwrap();
    let graph = settled(&plan, None);
    let gates = FakeGates {
        scan_delay: Duration::from_millis(200),
        ..FakeGates::failing_build()
    };

    let (report, gates, _root) =
        run(gates, FakeVcs::new(dir.path()), &plan, &graph, Duration::from_secs(5)).await;

    assert_eq!(names(&report), vec![COMPLETION, BUILD]);
    assert_eq!(report.skipped, vec![DOCUMENTATION, CROSS_REFERENCE]);
    let failure = report.failure().unwrap();
    assert_eq!(failure.name, BUILD);
    assert_eq!(failure.summary(), "build exited with status 101");
    assert!(failure.output.as_deref().unwrap_or_default().contains("exit 101"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gates.scans_finished.load(Ordering::SeqCst), 0);
}

/// Test: Incomplete graph fails the completion gate first
/// Given B failed and C blocked
/// When the pipeline runs
/// Then the completion summary names both and the build never runs
#[tokio::test]
async fn test_completion_gate_names_failed_and_blocked() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::parse(
        r#"
[[tasks]]
id = "A"

[[tasks]]
id = "B"
depends_on = ["A"]

[[tasks]]
id = "C"
depends_on = ["B"]
"#,
        Path::new("plan.toml"),
    )
    .unwrap();
    let graph = settled(&plan, Some("B"));

    let (report, gates, _root) = run(
        FakeGates::passing(),
        FakeVcs::new(dir.path()),
        &plan,
        &graph,
        Duration::from_secs(5),
    )
    .await;

    let failure = report.failure().unwrap();
    assert_eq!(failure.name, COMPLETION);
    assert_eq!(failure.summary(), "B failed, C blocked");
    assert_eq!(report.skipped, vec![BUILD, DOCUMENTATION, CROSS_REFERENCE]);
    assert_eq!(gates.builds.load(Ordering::SeqCst), 0);
}

/// Test: Documentation gate
/// Given a change with no documentation edits
/// When documentation is required, then when the plan turns it off
/// Then the gate fails and then passes
#[tokio::test]
async fn test_documentation_gate_follows_plan_policy() {
    let dir = TempDir::new().unwrap();
    let vcs = FakeVcs::new(dir.path());
    vcs.set_changed(vec![changed("src/lib.rs", ChangeKind::Modified)]);

    let plan = Plan::parse(TWO_TASKS, Path::new("plan.toml")).unwrap();
    let graph = settled(&plan, None);
    let (report, _, _root) =
        run(FakeGates::passing(), vcs.clone(), &plan, &graph, Duration::from_secs(5)).await;
    assert_eq!(report.failure().unwrap().name, DOCUMENTATION);
    assert_eq!(report.skipped, vec![CROSS_REFERENCE]);

    let relaxed = Plan::parse(
        &format!("[documentation]\nrequired = false\n{}", TWO_TASKS),
        Path::new("plan.toml"),
    )
    .unwrap();
    let (report, _, _root) =
        run(FakeGates::passing(), vcs, &relaxed, &graph, Duration::from_secs(5)).await;
    assert!(report.passed());
    assert_eq!(
        names(&report),
        vec![COMPLETION, BUILD, DOCUMENTATION, CROSS_REFERENCE]
    );
}

/// Test: Advisory scan findings are reported, not enforced
#[tokio::test]
async fn test_advisory_candidates_do_not_block() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::parse(TWO_TASKS, Path::new("plan.toml")).unwrap();
    let graph = settled(&plan, None);
    let gates = FakeGates {
        candidates: vec![DocCandidate {
            path: "docs/architecture.md".to_string(),
            score: 3,
            terms: vec!["lib.rs".to_string()],
        }],
        ..FakeGates::passing()
    };

    let (report, _, _root) =
        run(gates, FakeVcs::new(dir.path()), &plan, &graph, Duration::from_secs(5)).await;

    assert!(report.passed());
    assert_eq!(report.advisory.len(), 1);
    let cross = report.result(CROSS_REFERENCE).unwrap();
    assert!(!cross.hard);
    assert_eq!(cross.findings.len(), 1);
    assert!(cross.findings[0].starts_with("docs/architecture.md"));
}

/// Test: A slow scan times out without failing the run
#[tokio::test]
async fn test_scan_timeout_is_advisory() {
    let dir = TempDir::new().unwrap();
    let plan = Plan::parse(TWO_TASKS, Path::new("plan.toml")).unwrap();
    let graph = settled(&plan, None);
    let gates = FakeGates {
        scan_delay: Duration::from_secs(2),
        ..FakeGates::passing()
    };

    let (report, _, _root) = run(
        gates,
        FakeVcs::new(dir.path()),
        &plan,
        &graph,
        Duration::from_millis(20),
    )
    .await;

    assert!(report.passed());
    assert!(report.advisory.is_empty());
    let cross = report.result(CROSS_REFERENCE).unwrap();
    assert!(cross.output.as_deref().unwrap_or_default().contains("timed out"));
}

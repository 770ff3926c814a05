//! Dependency graph properties.
//!
//! The graph stays acyclic no matter the order tasks arrive in, forward
//! references resolve once their target appears, and readiness only ever
//! grows as dependencies complete.

use std::collections::HashSet;
use std::path::Path;

use baton::core::{Task, TaskGraph, TaskId, TaskStatus};
use baton::plan::Plan;
use baton::Error;

fn ids(tasks: &[&Task]) -> Vec<String> {
    tasks.iter().map(|t| t.id.to_string()).collect()
}

fn complete(graph: &mut TaskGraph, id: &str) {
    let id = TaskId::from(id);
    graph.transition(&id, TaskStatus::Ready).unwrap();
    graph.transition(&id, TaskStatus::InProgress).unwrap();
    graph.transition(&id, TaskStatus::Completed).unwrap();
}

/// Test: Cycle rejection in any insertion order
/// Given the tasks of a 3-cycle added in every rotation
/// When the closing task is added
/// Then it is rejected with Cycle and the graph is unchanged
#[test]
fn test_cycle_rejected_in_every_order() {
    let edges = [("A", "C"), ("B", "A"), ("C", "B")];
    for rotation in 0..edges.len() {
        let mut graph = TaskGraph::new();
        let order: Vec<_> = edges.iter().cycle().skip(rotation).take(edges.len()).collect();

        for &&(id, dep) in &order[..2] {
            graph
                .add_task(Task::new(id, id, "").with_deps(&[dep]))
                .unwrap();
        }
        let (nodes, edge_count) = (graph.len(), graph.edge_count());

        let &(id, dep) = order[2];
        let err = graph
            .add_task(Task::new(id, id, "").with_deps(&[dep]))
            .unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }), "rotation {rotation}: {err:?}");
        assert_eq!(graph.len(), nodes);
        assert_eq!(graph.edge_count(), edge_count);
        assert!(graph.topological_order().is_ok());
    }
}

/// Test: Cyclic plan fails to load into a graph
#[test]
fn test_cyclic_plan_is_rejected() {
    let plan = Plan::parse(
        r#"
[[tasks]]
id = "A"
depends_on = ["B"]

[[tasks]]
id = "B"
depends_on = ["A"]
"#,
        Path::new("loop.toml"),
    )
    .unwrap();
    let err = TaskGraph::from_plan(&plan).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));
    assert_eq!(err.exit_code(), 2);
}

/// Test: Forward references
/// Given C listed before the A and B it depends on
/// When the plan is loaded
/// Then C has both edges and only becomes ready once both complete
#[test]
fn test_forward_references_resolve() {
    let plan = Plan::parse(
        r#"
[[tasks]]
id = "C"
depends_on = ["A", "B"]

[[tasks]]
id = "A"

[[tasks]]
id = "B"
"#,
        Path::new("forward.toml"),
    )
    .unwrap();
    let mut graph = TaskGraph::from_plan(&plan).unwrap();
    assert_eq!(graph.edge_count(), 2);
    assert_eq!(ids(&graph.ready_tasks()), vec!["A", "B"]);

    complete(&mut graph, "A");
    assert_eq!(ids(&graph.ready_tasks()), vec!["B"]);
    complete(&mut graph, "B");
    assert_eq!(ids(&graph.ready_tasks()), vec!["C"]);

    let order = ids(&graph.topological_order().unwrap());
    let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
    assert!(pos("A") < pos("C"));
    assert!(pos("B") < pos("C"));
}

/// Test: Unknown dependency
#[test]
fn test_dangling_reference_is_validation_error() {
    let plan = Plan::parse(
        "[[tasks]]\nid = \"A\"\ndepends_on = [\"ghost\"]\n",
        Path::new("dangling.toml"),
    )
    .unwrap();
    match TaskGraph::from_plan(&plan) {
        Err(Error::Validation(msg)) => assert!(msg.contains("ghost")),
        other => panic!("unexpected: {other:?}"),
    }
}

/// Test: Readiness monotonicity
/// Given a diamond A -> {B, C} -> D
/// When tasks complete one at a time
/// Then a ready task stays ready until it is dispatched, and no task is
/// ever ready before all of its dependencies completed
#[test]
fn test_readiness_is_monotonic() {
    let mut graph = TaskGraph::new();
    graph.add_task(Task::new("A", "A", "")).unwrap();
    graph.add_task(Task::new("B", "B", "").with_deps(&["A"])).unwrap();
    graph.add_task(Task::new("C", "C", "").with_deps(&["A"])).unwrap();
    graph
        .add_task(Task::new("D", "D", "").with_deps(&["B", "C"]))
        .unwrap();

    let mut previously_ready: HashSet<String> = HashSet::new();
    let mut dispatched: HashSet<String> = HashSet::new();
    for step in ["A", "B", "C", "D"] {
        let ready: HashSet<String> = ids(&graph.ready_tasks()).into_iter().collect();
        for id in previously_ready.difference(&dispatched) {
            assert!(ready.contains(id), "{id} lost readiness before dispatch");
        }
        for id in &ready {
            let task = graph.get(&TaskId::from(id.as_str())).unwrap();
            for dep in &task.blocked_by {
                assert_eq!(graph.get(dep).unwrap().status, TaskStatus::Completed);
            }
        }
        assert!(ready.contains(step), "{step} should be ready");

        previously_ready = ready;
        complete(&mut graph, step);
        dispatched.insert(step.to_string());
    }
    assert!(graph.is_settled());
    assert_eq!(graph.summary().completed, 4);
}

/// Test: Failure blocks the whole downstream cone
#[test]
fn test_failure_blocks_transitive_dependents() {
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

[[tasks]]
id = "D"
"#,
        Path::new("cone.toml"),
    )
    .unwrap();
    let mut graph = TaskGraph::from_plan(&plan).unwrap();
    let a = TaskId::from("A");
    graph.transition(&a, TaskStatus::Ready).unwrap();
    graph.transition(&a, TaskStatus::InProgress).unwrap();
    graph.fail(&a, "boom").unwrap();

    let blocked = graph.block_dependents(&a);
    assert_eq!(blocked, vec![TaskId::from("B"), TaskId::from("C")]);
    assert_eq!(ids(&graph.ready_tasks()), vec!["D"]);

    let summary = graph.summary();
    assert_eq!((summary.failed, summary.blocked, summary.pending), (1, 2, 1));
}

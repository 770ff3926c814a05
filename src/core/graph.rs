//! Task graph for dependency management.
//!
//! The graph owns every task of a plan run. Edges point from a dependency to
//! its dependent, and the graph is kept acyclic at all times: a task whose
//! edges would close a cycle is rejected and the graph is left untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::plan::Plan;

/// Graph shared between the orchestrator loop and the health monitor.
pub type SharedGraph = Arc<RwLock<TaskGraph>>;

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub pending: usize,
    pub blocked: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl GraphSummary {
    pub fn total(&self) -> usize {
        self.pending + self.blocked + self.ready + self.in_progress + self.completed + self.failed
    }
}

impl std::fmt::Display for GraphSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} failed, {} blocked, {} running, {} pending",
            self.completed,
            self.total(),
            self.failed,
            self.blocked,
            self.in_progress + self.ready,
            self.pending
        )
    }
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Dependencies named before the task they refer to was added,
    /// keyed by the missing id.
    awaiting: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            awaiting: HashMap::new(),
        }
    }

    /// Build the graph from a plan, in plan order.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        let mut graph = Self::new();
        for def in &plan.tasks {
            graph.add_task(Task::from_def(def))?;
        }
        graph.ensure_resolved()?;
        Ok(graph)
    }

    /// Rebuild a graph from a persisted snapshot, keeping task state.
    pub fn restore(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        graph.ensure_resolved()?;
        Ok(graph)
    }

    pub fn into_shared(self) -> SharedGraph {
        Arc::new(RwLock::new(self))
    }

    /// Add a task and the edges for its `blocked_by` list.
    ///
    /// Dependencies on tasks not yet present are recorded and turned into
    /// edges when the missing task arrives.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id.to_string()));
        }

        let id = task.id.clone();
        let deps = task.blocked_by.clone();
        let node = self.graph.add_node(task);
        self.index.insert(id.clone(), node);

        let mut deferred = Vec::new();
        for dep in &deps {
            match self.index.get(dep) {
                Some(&dep_node) => {
                    self.graph.update_edge(dep_node, node, ());
                }
                None => {
                    self.awaiting.entry(dep.clone()).or_default().push(id.clone());
                    deferred.push(dep.clone());
                }
            }
        }

        let waiting_on_us = self.awaiting.remove(&id);
        if let Some(dependents) = &waiting_on_us {
            for dependent in dependents {
                if let Some(&dependent_node) = self.index.get(dependent) {
                    self.graph.update_edge(node, dependent_node, ());
                }
            }
        }

        if is_cyclic_directed(&self.graph) {
            self.rollback(&id, node, &deferred, waiting_on_us);
            warn!(task = %id, "rejected task: dependency cycle");
            return Err(Error::Cycle {
                task: id.to_string(),
            });
        }

        debug!(task = %id, deps = deps.len(), "task added to graph");
        Ok(node)
    }

    /// Undo the most recent `add_task`. The node is the last one added, so
    /// removing it leaves every other index stable.
    fn rollback(
        &mut self,
        id: &TaskId,
        node: NodeIndex,
        deferred: &[TaskId],
        waiting_on_us: Option<Vec<TaskId>>,
    ) {
        self.graph.remove_node(node);
        self.index.remove(id);
        for dep in deferred {
            if let Some(list) = self.awaiting.get_mut(dep) {
                list.retain(|t| t != id);
                if list.is_empty() {
                    self.awaiting.remove(dep);
                }
            }
        }
        if let Some(dependents) = waiting_on_us {
            self.awaiting.insert(id.clone(), dependents);
        }
    }

    /// Fail if any recorded dependency never appeared.
    pub fn ensure_resolved(&self) -> Result<()> {
        let mut missing: Vec<String> = self
            .awaiting
            .iter()
            .flat_map(|(dep, dependents)| {
                dependents
                    .iter()
                    .map(move |t| format!("{} depends on unknown task {}", t, dep))
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(Error::Validation(missing.join("; ")))
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|&n| self.graph.node_weight(n))
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let node = *self
            .index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        self.graph
            .node_weight_mut(node)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().filter_map(|n| self.graph.node_weight(n))
    }

    /// Tasks that `id` depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend directly on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.index.get(id) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Pending tasks whose dependencies have all completed, in insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.blocked_by.iter().all(|dep| {
                    self.get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Apply a status change. Only Pending -> Ready -> InProgress ->
    /// {Completed | Failed} is allowed.
    pub fn transition(&mut self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let task = self.get_mut(id)?;
        if !task.status.can_transition_to(status) {
            return Err(Error::IllegalTransition {
                task: id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }
        debug!(task = %id, from = %task.status, to = %status, "task transition");
        task.apply(status);
        Ok(())
    }

    /// Record the worker assigned to a task.
    pub fn assign(&mut self, id: &TaskId, agent_id: &str) -> Result<()> {
        self.get_mut(id)?.agent_id = Some(agent_id.to_string());
        Ok(())
    }

    /// Move an in-progress task to Failed, keeping the reason.
    pub fn fail(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.transition(id, TaskStatus::Failed)?;
        self.get_mut(id)?.error = Some(reason.to_string());
        Ok(())
    }

    /// Mark every transitive Pending dependent of `id` as Blocked.
    ///
    /// Returns the ids that were blocked, in traversal order.
    pub fn block_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };

        let mut blocked = Vec::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            for dependent in next {
                if let Some(task) = self.graph.node_weight_mut(dependent) {
                    if task.status == TaskStatus::Pending {
                        task.status = TaskStatus::Blocked;
                        task.error = Some(format!("blocked by {}", id));
                        blocked.push(task.id.clone());
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if !blocked.is_empty() {
            debug!(task = %id, count = blocked.len(), "blocked dependents");
        }
        blocked
    }

    pub fn in_progress(&self) -> Vec<&Task> {
        self.tasks()
            .filter(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::InProgress))
            .collect()
    }

    /// Nothing is running and nothing can start.
    pub fn is_settled(&self) -> bool {
        self.in_progress().is_empty() && self.ready_tasks().is_empty()
    }

    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary::default();
        for task in self.tasks() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Ready => summary.ready += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Tasks ordered so every task follows its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::Cycle {
            task: self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_default(),
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n))
            .collect())
    }

    /// Copy of every task in insertion order, for persistence.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks().cloned().collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("edges", &self.edge_count())
            .field("awaiting", &self.awaiting.len())
            .finish()
    }
}

//! Task data model for the plan graph.
//!
//! Tasks are the dispatchable units of a plan. Each task tracks its status,
//! the worker assigned to it, and when it started and finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::TaskDef;

/// Identifier of a task within a plan.
///
/// Ids come from the plan document and are only unique within one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// A dependency failed; the task can never become ready.
    Blocked,
    /// Dependencies satisfied, about to be dispatched.
    Ready,
    /// A worker is executing the task.
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state (Completed or Failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The only legal moves: Pending -> Ready -> InProgress -> {Completed | Failed}.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Ready)
                | (TaskStatus::Ready, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A single task in the plan graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Human-readable subject line.
    pub subject: String,
    /// Instructions handed to the worker.
    pub description: String,
    /// Worker role from the plan's team.
    pub role: String,
    /// Dispatch in the background alongside other ready tasks.
    pub parallel: bool,
    pub blocked_by: Vec<TaskId>,
    pub documentation_required: bool,
    /// A failed optional task neither halts the run nor fails the completion gate.
    #[serde(default)]
    pub optional: bool,
    pub status: TaskStatus,
    /// Opaque id of the worker executing this task.
    pub agent_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason, when status is Failed.
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: &str, subject: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(id),
            subject: subject.to_string(),
            description: description.to_string(),
            role: String::new(),
            parallel: false,
            blocked_by: Vec::new(),
            documentation_required: false,
            optional: false,
            status: TaskStatus::Pending,
            agent_id: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn from_def(def: &TaskDef) -> Self {
        Self {
            role: def.role.clone(),
            parallel: def.parallel,
            blocked_by: def.depends_on.iter().map(|d| TaskId::new(d.as_str())).collect(),
            documentation_required: def.documentation_required,
            optional: def.optional,
            ..Self::new(&def.id, &def.subject, &def.description)
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.blocked_by = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Record status-dependent bookkeeping after a legal transition.
    pub(crate) fn apply(&mut self, status: TaskStatus) {
        self.status = status;
        match status {
            TaskStatus::InProgress => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed => self.finished_at = Some(Utc::now()),
            _ => {}
        }
    }
}

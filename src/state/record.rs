//! Persisted state of one plan run.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::Task;
use crate::orchestration::worker::WorkerHandle;
use crate::workspace::EnvironmentHandle;

/// Unique identifier for a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Tasks are being dispatched and polled.
    Executing,
    Gating,
    Finalizing,
    /// Published and archived.
    Finalized,
    /// Stopped by a task or gate failure; environment kept.
    Halted,
    /// Stopped by the operator.
    Aborted,
}

impl RunPhase {
    /// A run in this phase may still have live workers.
    pub fn is_live(self) -> bool {
        matches!(self, RunPhase::Executing | RunPhase::Gating | RunPhase::Finalizing)
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Executing => write!(f, "executing"),
            RunPhase::Gating => write!(f, "gating"),
            RunPhase::Finalizing => write!(f, "finalizing"),
            RunPhase::Finalized => write!(f, "finalized"),
            RunPhase::Halted => write!(f, "halted"),
            RunPhase::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub slug: String,
    pub plan_path: PathBuf,
    pub environment: Option<EnvironmentHandle>,
    /// Task graph snapshot in insertion order.
    pub graph: Vec<Task>,
    /// Workers that have not reached a terminal state.
    pub handles: Vec<WorkerHandle>,
    pub phase: RunPhase,
    /// URL of the published change, persisted as soon as it exists.
    pub artifact: Option<String>,
    pub archived: bool,
    pub halt_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(slug: &str, plan_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            slug: slug.to_string(),
            plan_path,
            environment: None,
            graph: Vec::new(),
            handles: Vec::new(),
            phase: RunPhase::Executing,
            artifact: None,
            archived: false,
            halt_reason: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The run was cut off mid-flight and its graph and handles are worth
    /// re-attaching to.
    pub fn can_rehydrate(&self) -> bool {
        self.phase.is_live() && self.environment.is_some() && !self.graph.is_empty()
    }
}

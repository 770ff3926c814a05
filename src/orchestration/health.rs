//! Health monitoring for workers.
//!
//! Liveness is derived from one timestamp, the last time a worker produced
//! output, compared against two thresholds:
//!
//! - below the warning threshold the worker is **Healthy**;
//! - from the warning threshold up to the failure threshold it is
//!   **Warning** (logged, no action);
//! - at or beyond the failure threshold it is **Stalled**.
//!
//! A stalled worker gets exactly one resume. If the resume is refused, or no
//! output arrives within the grace window, the worker is declared failed: the
//! environment receives a best-effort safety commit, the task moves to
//! Failed and its dependents are blocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{SharedGraph, TaskId, TaskStatus};
use crate::orchestration::dispatcher::Dispatcher;
use crate::orchestration::worker::{TerminalStatus, WorkerHandle};
use crate::util::blocking_with_timeout;
use crate::vcs::VersionControl;
use crate::workspace::EnvironmentHandle;
use crate::{Error, Result};

/// Resumes a stalled worker gets before it is declared failed.
const MAX_RESUMES: u32 = 1;

/// Classification of a worker's silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Stalled,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Stalled => write!(f, "stalled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub warning_threshold: Duration,
    pub failure_threshold: Duration,
    /// How long to wait for output after a resume.
    pub resume_grace: Duration,
    /// Bound on a single safety commit.
    pub safety_commit_timeout: Duration,
}

impl HealthConfig {
    pub fn from_config(config: &Config) -> Self {
        let h = &config.health;
        Self {
            warning_threshold: Duration::from_secs(h.warning_threshold_secs),
            failure_threshold: Duration::from_secs(h.failure_threshold_secs),
            resume_grace: Duration::from_secs(h.resume_grace_secs),
            safety_commit_timeout: config.safety_commit_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What a tick did for one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Warned,
    /// Resume accepted; waiting for output within the grace window.
    Resumed,
    AwaitingOutput,
    /// Output arrived after a resume.
    Recovered,
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: HealthStatus,
    pub action: HealthAction,
    pub silent_secs: i64,
}

impl HealthReport {
    /// The handle reached a terminal state on this tick.
    pub fn is_final(&self) -> bool {
        matches!(
            self.action,
            HealthAction::Completed | HealthAction::Failed { .. }
        )
    }
}

/// Pure classification of a handle's silence at `now`.
pub fn classify(handle: &WorkerHandle, now: DateTime<Utc>, config: &HealthConfig) -> HealthStatus {
    let silent = handle.silence(now).to_std().unwrap_or_default();
    if silent >= config.failure_threshold {
        HealthStatus::Stalled
    } else if silent >= config.warning_threshold {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    dispatcher: Arc<Dispatcher>,
    vcs: Arc<dyn VersionControl>,
    graph: SharedGraph,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        dispatcher: Arc<Dispatcher>,
        vcs: Arc<dyn VersionControl>,
        graph: SharedGraph,
    ) -> Self {
        Self {
            config,
            dispatcher,
            vcs,
            graph,
        }
    }

    /// Poll and evaluate every live handle once.
    pub async fn tick(
        &self,
        handles: &mut [WorkerHandle],
        env: &EnvironmentHandle,
        now: DateTime<Utc>,
    ) -> Vec<HealthReport> {
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles.iter_mut().filter(|h| !h.is_terminal()) {
            if let Err(e) = self.dispatcher.poll(handle).await {
                warn!(task = %handle.task_id, error = %e, "poll failed");
            }
            reports.push(self.evaluate(handle, env, now).await);
        }
        reports
    }

    /// Evaluate one handle that has just been polled.
    pub async fn evaluate(
        &self,
        handle: &mut WorkerHandle,
        env: &EnvironmentHandle,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let status = classify(handle, now, &self.config);
        let silent_secs = handle.silence(now).num_seconds();
        let action = self.decide(handle, status, env, now).await;
        HealthReport {
            task_id: handle.task_id.clone(),
            agent_id: handle.agent_id.clone(),
            status,
            action,
            silent_secs,
        }
    }

    async fn decide(
        &self,
        handle: &mut WorkerHandle,
        status: HealthStatus,
        env: &EnvironmentHandle,
        now: DateTime<Utc>,
    ) -> HealthAction {
        match handle.outcome.clone() {
            Some(TerminalStatus::Completed) => return self.complete(handle).await,
            Some(TerminalStatus::Failed { reason }) => {
                return self.fail(handle, env, &reason).await;
            }
            None => {}
        }

        if let Some(resumed_at) = handle.resumed_at {
            if handle.last_output_at > resumed_at {
                info!(task = %handle.task_id, "worker recovered after resume");
                handle.resumed_at = None;
                handle.warned = false;
                return HealthAction::Recovered;
            }
            let waited = now.signed_duration_since(resumed_at).to_std().unwrap_or_default();
            if waited >= self.config.resume_grace {
                let reason = format!("no output within {}s of resume", self.config.resume_grace.as_secs());
                return self.fail(handle, env, &reason).await;
            }
            return HealthAction::AwaitingOutput;
        }

        match status {
            HealthStatus::Healthy => {
                handle.warned = false;
                HealthAction::None
            }
            HealthStatus::Warning => {
                // Logged once per silent stretch, not on every tick.
                if !handle.warned {
                    handle.warned = true;
                    warn!(
                        task = %handle.task_id,
                        silent_secs = handle.silence(now).num_seconds(),
                        "worker silent past warning threshold"
                    );
                }
                HealthAction::Warned
            }
            HealthStatus::Stalled => self.escalate(handle, env, now).await,
        }
    }

    async fn escalate(
        &self,
        handle: &mut WorkerHandle,
        env: &EnvironmentHandle,
        now: DateTime<Utc>,
    ) -> HealthAction {
        let stall = Error::StallTimeout {
            task: handle.task_id.to_string(),
            silent_secs: handle.silence(now).num_seconds(),
        };
        if handle.resumes_used >= MAX_RESUMES {
            return self.fail(handle, env, &stall.to_string()).await;
        }

        warn!(task = %handle.task_id, agent = %handle.agent_id, "{}, attempting resume", stall);
        match self.dispatcher.resume(handle).await {
            Ok(true) => HealthAction::Resumed,
            Ok(false) => {
                let reason = format!("{}; resume refused", stall);
                self.fail(handle, env, &reason).await
            }
            Err(e) => {
                let reason = format!("{}; resume failed: {}", stall, e);
                self.fail(handle, env, &reason).await
            }
        }
    }

    async fn complete(&self, handle: &mut WorkerHandle) -> HealthAction {
        handle.outcome = Some(TerminalStatus::Completed);
        let mut graph = self.graph.write().await;
        if let Err(e) = graph.transition(&handle.task_id, TaskStatus::Completed) {
            error!(task = %handle.task_id, error = %e, "could not record completion");
            return HealthAction::Failed {
                reason: e.to_string(),
            };
        }
        info!(task = %handle.task_id, "task completed");
        HealthAction::Completed
    }

    async fn fail(&self, handle: &mut WorkerHandle, env: &EnvironmentHandle, reason: &str) -> HealthAction {
        error!(task = %handle.task_id, agent = %handle.agent_id, reason, "worker failed");
        handle.outcome = Some(TerminalStatus::Failed {
            reason: reason.to_string(),
        });
        handle.resumed_at = None;

        let message = format!("baton: safety commit for task {} ({})", handle.task_id, reason);
        safety_commit(self.vcs.clone(), env, message, self.config.safety_commit_timeout).await;

        let mut graph = self.graph.write().await;
        match graph.fail(&handle.task_id, reason) {
            Ok(()) => {
                let blocked = graph.block_dependents(&handle.task_id);
                if !blocked.is_empty() {
                    info!(task = %handle.task_id, blocked = ?blocked, "dependents blocked");
                }
            }
            Err(e) => error!(task = %handle.task_id, error = %e, "could not record failure"),
        }
        HealthAction::Failed {
            reason: reason.to_string(),
        }
    }
}

/// Commit whatever is in the environment. Never fails; returns whether a
/// commit was made.
pub async fn safety_commit(
    vcs: Arc<dyn VersionControl>,
    env: &EnvironmentHandle,
    message: String,
    timeout: Duration,
) -> bool {
    let root = env.root.clone();
    let result: Result<bool> =
        blocking_with_timeout(timeout, move || Ok(vcs.commit_all(&root, &message))).await;
    match result {
        Ok(committed) => {
            debug!(root = %env.root.display(), committed, "safety commit");
            committed
        }
        Err(e) => {
            warn!(root = %env.root.display(), error = %e, "safety commit did not finish");
            false
        }
    }
}

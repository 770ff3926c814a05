//! Worker boundary.
//!
//! Workers are opaque agents reached through three calls: invoke, poll and
//! resume. [`WorkerRuntime`] is that capability; [`TmuxRuntime`] runs each
//! worker command in a detached tmux session.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::TaskId;
use crate::tmux::{PaneState, Tmux};
use crate::util::blocking;
use crate::{Error, Result};

/// Everything a worker needs to start on a task.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub role: String,
    /// Worker type from the plan's team, used to pick the command.
    pub worker_type: Option<String>,
    pub instructions: String,
    /// Environment root the worker runs in.
    pub root: PathBuf,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub agent_id: String,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TerminalStatus {
    Completed,
    Failed { reason: String },
}

/// One observation of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoll {
    pub last_output_at: DateTime<Utc>,
    pub terminal: bool,
    pub terminal_status: Option<TerminalStatus>,
}

#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn invoke(&self, request: &WorkerRequest) -> Result<Invocation>;

    async fn poll(&self, agent_id: &str) -> Result<WorkerPoll>;

    /// Nudge a stalled worker. `false` means the worker cannot be resumed.
    async fn resume(&self, agent_id: &str) -> Result<bool>;

    /// Drop whatever the runtime keeps for a finished worker.
    async fn release(&self, _agent_id: &str) -> Result<()> {
        Ok(())
    }
}

/// A dispatched worker as tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub task_id: TaskId,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub last_output_at: DateTime<Utc>,
    pub background: bool,
    pub resumes_used: u32,
    /// The current silent stretch has already been logged as a warning.
    #[serde(default)]
    pub warned: bool,
    /// Set while waiting for output after a resume.
    pub resumed_at: Option<DateTime<Utc>>,
    pub outcome: Option<TerminalStatus>,
}

impl WorkerHandle {
    pub fn new(task_id: TaskId, invocation: Invocation) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            agent_id: invocation.agent_id,
            created_at: now,
            last_output_at: now,
            background: invocation.background,
            resumes_used: 0,
            warned: false,
            resumed_at: None,
            outcome: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Time since the worker last produced output.
    pub fn silence(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_output_at)
    }

    /// Apply a poll result. Output timestamps never move backwards.
    pub fn observe(&mut self, poll: WorkerPoll) {
        if poll.last_output_at > self.last_output_at {
            self.last_output_at = poll.last_output_at;
        }
        if poll.terminal {
            self.outcome = Some(poll.terminal_status.unwrap_or(TerminalStatus::Completed));
        }
    }
}

/// Runs workers in detached tmux sessions named after the plan and task.
pub struct TmuxRuntime {
    config: Config,
    slug: String,
}

impl TmuxRuntime {
    pub fn new(config: Config, slug: &str) -> Self {
        Self {
            config,
            slug: slug.to_string(),
        }
    }

    fn command_line(&self, request: &WorkerRequest) -> Vec<String> {
        let mut cmd: Vec<String> = self
            .config
            .worker_command(request.worker_type.as_deref())
            .split_whitespace()
            .map(String::from)
            .collect();
        cmd.push(request.instructions.clone());
        cmd
    }
}

#[async_trait]
impl WorkerRuntime for TmuxRuntime {
    async fn invoke(&self, request: &WorkerRequest) -> Result<Invocation> {
        let dispatch_err = |message: String| Error::Dispatch {
            task: request.task_id.to_string(),
            message,
        };
        if !Tmux::is_available() {
            return Err(dispatch_err("tmux is not installed".to_string()));
        }
        let cmd = self.command_line(request);
        let program = cmd.first().cloned().unwrap_or_default();
        if which::which(&program).is_err() {
            return Err(dispatch_err(format!("worker binary '{}' not found", program)));
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let name = Tmux::session_name(&self.slug, request.task_id.as_str(), &suffix[..8]);
        let root = request.root.clone();
        let session = name.clone();
        blocking(move || Tmux::create_session(&session, &root, &cmd))
            .await
            .map_err(|e| dispatch_err(e.to_string()))?;

        info!(task = %request.task_id, session = %name, role = %request.role, "worker started");
        Ok(Invocation {
            agent_id: name,
            background: request.background,
        })
    }

    async fn poll(&self, agent_id: &str) -> Result<WorkerPoll> {
        let name = agent_id.to_string();
        blocking(move || {
            if !Tmux::session_exists(&name) {
                return Ok(WorkerPoll {
                    last_output_at: Utc::now(),
                    terminal: true,
                    terminal_status: Some(TerminalStatus::Failed {
                        reason: "worker session disappeared".to_string(),
                    }),
                });
            }
            let activity = Tmux::pane_activity(&name)?;
            let last_output_at = Utc
                .timestamp_opt(activity, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let terminal_status = match Tmux::pane_state(&name)? {
                PaneState::Running => None,
                PaneState::Exited(0) => Some(TerminalStatus::Completed),
                PaneState::Exited(code) => Some(TerminalStatus::Failed {
                    reason: format!("worker exited with status {}", code),
                }),
            };
            Ok(WorkerPoll {
                last_output_at,
                terminal: terminal_status.is_some(),
                terminal_status,
            })
        })
        .await
    }

    async fn resume(&self, agent_id: &str) -> Result<bool> {
        let name = agent_id.to_string();
        let prompt = self.config.worker.resume_prompt.clone();
        blocking(move || {
            if !Tmux::session_exists(&name) {
                debug!(session = %name, "cannot resume, session gone");
                return Ok(false);
            }
            if Tmux::pane_state(&name)? != PaneState::Running {
                debug!(session = %name, "cannot resume, worker exited");
                return Ok(false);
            }
            Tmux::send_keys_enter(&name, &prompt)?;
            Ok(true)
        })
        .await
    }

    async fn release(&self, agent_id: &str) -> Result<()> {
        let name = agent_id.to_string();
        if let Err(e) = blocking(move || Tmux::kill_session(&name)).await {
            warn!(session = %agent_id, error = %e, "failed to release worker session");
        }
        Ok(())
    }
}

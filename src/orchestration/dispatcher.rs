//! Worker dispatch with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::Task;
use crate::orchestration::worker::{WorkerHandle, WorkerRequest, WorkerRuntime};
use crate::workspace::EnvironmentHandle;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Extra attempts after the first failed invocation.
    pub retries: u32,
    /// Delay before the first retry; doubled for each further one.
    pub backoff: Duration,
    pub poll_interval: Duration,
    /// Silence after which a synchronous wait hands the worker to the health monitor.
    pub failure_threshold: Duration,
}

impl DispatchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.dispatch.retries,
            backoff: Duration::from_millis(config.dispatch.backoff_ms),
            poll_interval: Duration::from_secs(config.health.poll_interval_secs),
            failure_threshold: Duration::from_secs(config.health.failure_threshold_secs),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct Dispatcher {
    runtime: Arc<dyn WorkerRuntime>,
    config: DispatchConfig,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        config: DispatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            config,
            cancel,
        }
    }

    /// Start exactly one worker for `task` in `env`.
    ///
    /// With `background = false` this waits until the worker is terminal, has
    /// been silent for the failure threshold, or the run is cancelled. The
    /// returned handle is non-terminal in the last two cases.
    pub async fn dispatch(
        &self,
        task: &Task,
        env: &EnvironmentHandle,
        worker_type: Option<&str>,
        background: bool,
    ) -> Result<WorkerHandle> {
        let mut handle = self.start(task, env, worker_type, background).await?;
        if !background {
            self.wait(&mut handle).await;
        }
        Ok(handle)
    }

    /// Invoke the worker without waiting for it.
    pub async fn start(
        &self,
        task: &Task,
        env: &EnvironmentHandle,
        worker_type: Option<&str>,
        background: bool,
    ) -> Result<WorkerHandle> {
        let request = WorkerRequest {
            task_id: task.id.clone(),
            role: task.role.clone(),
            worker_type: worker_type.map(String::from),
            instructions: instructions(task),
            root: env.root.clone(),
            background,
        };
        self.invoke_with_retry(&request).await
    }

    async fn invoke_with_retry(&self, request: &WorkerRequest) -> Result<WorkerHandle> {
        let mut attempt = 0;
        loop {
            match self.runtime.invoke(request).await {
                Ok(invocation) => {
                    debug!(task = %request.task_id, agent = %invocation.agent_id, attempt, "worker invoked");
                    return Ok(WorkerHandle::new(request.task_id.clone(), invocation));
                }
                Err(e) if attempt < self.config.retries && !self.cancel.is_cancelled() => {
                    let delay = self.config.backoff.saturating_mul(1 << attempt.min(16));
                    warn!(task = %request.task_id, attempt, error = %e, ?delay, "dispatch failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(match e {
                        Error::Dispatch { .. } => e,
                        other => Error::Dispatch {
                            task: request.task_id.to_string(),
                            message: other.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Poll a started worker until it is terminal, silent past the failure
    /// threshold, or the run is cancelled.
    pub async fn wait(&self, handle: &mut WorkerHandle) {
        loop {
            if let Err(e) = self.poll(handle).await {
                warn!(task = %handle.task_id, error = %e, "poll failed");
            }
            if handle.is_terminal() {
                info!(task = %handle.task_id, outcome = ?handle.outcome, "synchronous worker finished");
                return;
            }
            let silent = handle.silence(Utc::now()).to_std().unwrap_or_default();
            if silent >= self.config.failure_threshold {
                warn!(task = %handle.task_id, silent_secs = silent.as_secs(), "synchronous worker went silent");
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Refresh a handle from the runtime.
    pub async fn poll(&self, handle: &mut WorkerHandle) -> Result<()> {
        let poll = self.runtime.poll(&handle.agent_id).await?;
        handle.observe(poll);
        Ok(())
    }

    /// Re-attach to a worker through its agent id.
    pub async fn resume(&self, handle: &mut WorkerHandle) -> Result<bool> {
        handle.resumes_used += 1;
        let resumed = self.runtime.resume(&handle.agent_id).await?;
        if resumed {
            handle.resumed_at = Some(Utc::now());
        }
        Ok(resumed)
    }
}

/// Prompt handed to the worker.
fn instructions(task: &Task) -> String {
    if task.subject.is_empty() {
        format!("Task {}:\n\n{}", task.id, task.description)
    } else {
        format!("Task {}: {}\n\n{}", task.id, task.subject, task.description)
    }
}

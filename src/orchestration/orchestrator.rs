//! The run loop.
//!
//! `Orchestrator::run` drives one plan from environment creation to
//! finalization:
//!
//! 1. Skip plans an earlier run already archived; claim the slug's run lock.
//! 2. Create the environment (or rehydrate a crashed run from its record).
//! 3. Dispatch ready tasks, parallel ones in the background first, then the
//!    sequential ones one at a time; tick the health monitor over background
//!    workers; persist the run record after every step.
//! 4. Run the gate pipeline once nothing is left to do or the failure policy
//!    halts the run.
//! 5. Finalize and tear the environment down, or preserve it for inspection.
//!
//! An operator abort (abort marker or Ctrl-C) stops dispatching, takes one
//! safety commit of the shared environment, releases the live workers and
//! removes the worktree while keeping the branch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{GraphSummary, SharedGraph, Task, TaskGraph, TaskStatus};
use crate::orchestration::dispatcher::{DispatchConfig, Dispatcher};
use crate::orchestration::finalizer::{FinalizeOutcome, Finalizer, Tracker};
use crate::orchestration::gates::{GateCommands, GatePipeline, GateReport};
use crate::orchestration::health::{safety_commit, HealthAction, HealthConfig, HealthMonitor};
use crate::orchestration::worker::{WorkerHandle, WorkerRuntime};
use crate::plan::Plan;
use crate::state::{RunId, RunPhase, RunRecord, RunStore};
use crate::util::tail;
use crate::vcs::VersionControl;
use crate::workspace::{EnvironmentGuard, EnvironmentHandle, Teardown, WorkspaceManager};
use crate::Result;

/// Output kept from a failing gate in the log.
const GATE_OUTPUT_LOG_CHARS: usize = 2000;

/// Tunables for one run, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub scan_timeout: Duration,
    pub archive_dir: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            dispatch: DispatchConfig::from_config(config),
            health: HealthConfig::from_config(config),
            scan_timeout: Duration::from_secs(config.gates.scan_timeout_secs),
            archive_dir: config.archive_path()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finalized,
    /// An earlier run archived the plan; nothing was done.
    AlreadyFinalized,
    /// A hard gate failed; the environment was preserved.
    GateFailed,
    /// Stopped by the operator.
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Finalized => write!(f, "finalized"),
            RunStatus::AlreadyFinalized => write!(f, "already finalized"),
            RunStatus::GateFailed => write!(f, "gate failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub slug: String,
    pub status: RunStatus,
    pub summary: GraphSummary,
    pub tasks: Vec<Task>,
    pub gates: Option<GateReport>,
    pub finalize: Option<FinalizeOutcome>,
    /// Environment root left on disk for inspection.
    pub preserved: Option<PathBuf>,
    pub halt_reason: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Finalized | RunStatus::AlreadyFinalized)
    }

    /// CLI exit code: 0 success, 1 gate failure, 3 aborted.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Finalized | RunStatus::AlreadyFinalized => 0,
            RunStatus::GateFailed => 1,
            RunStatus::Aborted => 3,
        }
    }

    pub fn artifact_url(&self) -> Option<&str> {
        match &self.finalize {
            Some(FinalizeOutcome::Finalized { artifact_url, .. }) => Some(artifact_url),
            _ => None,
        }
    }
}

/// How the dispatch loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopExit {
    Settled,
    /// The failure policy stopped dispatching.
    Halted(String),
    Aborted,
}

/// Mutable state of one run.
struct Run<'a> {
    plan: &'a Plan,
    /// Dropped on any early exit, which tears the environment down.
    guard: Option<EnvironmentGuard>,
    env: EnvironmentHandle,
    graph: SharedGraph,
    dispatcher: Arc<Dispatcher>,
    health: HealthMonitor,
    handles: Vec<WorkerHandle>,
    record: RunRecord,
    /// Child of the orchestrator token; also cancelled by the abort marker.
    cancel: CancellationToken,
}

pub struct Orchestrator {
    settings: RunSettings,
    runtime: Arc<dyn WorkerRuntime>,
    vcs: Arc<dyn VersionControl>,
    gates: Arc<dyn GateCommands>,
    tracker: Arc<dyn Tracker>,
    store: RunStore,
    workspace: Arc<WorkspaceManager>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        runtime: Arc<dyn WorkerRuntime>,
        vcs: Arc<dyn VersionControl>,
        gates: Arc<dyn GateCommands>,
        tracker: Arc<dyn Tracker>,
        store: RunStore,
    ) -> Self {
        let workspace = Arc::new(WorkspaceManager::new(vcs.clone()));
        Self {
            settings,
            runtime,
            vcs,
            gates,
            tracker,
            store,
            workspace,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive `plan` to a finalized change, a halted run or an abort.
    pub async fn run(&self, plan: &Plan) -> Result<RunReport> {
        // Held until this function returns; a second run of the slug must not
        // adopt this run's environment or clear its abort marker.
        let _lock = self.store.lock(&plan.slug)?;
        let previous = self.store.load(&plan.slug)?;
        if let Some(record) = previous.as_ref().filter(|r| r.archived) {
            info!(slug = %plan.slug, run = %record.run_id.short(), "plan already archived, nothing to do");
            return Ok(RunReport {
                run_id: record.run_id,
                slug: plan.slug.clone(),
                status: RunStatus::AlreadyFinalized,
                summary: TaskGraph::restore(record.graph.clone())
                    .map(|g| g.summary())
                    .unwrap_or_default(),
                tasks: record.graph.clone(),
                gates: None,
                finalize: Some(FinalizeOutcome::AlreadyFinalized),
                preserved: None,
                halt_reason: None,
            });
        }
        self.store.clear_abort(&plan.slug)?;

        let cancel = self.cancel.child_token();
        let dispatcher = Arc::new(Dispatcher::new(
            self.runtime.clone(),
            self.settings.dispatch.clone(),
            cancel.clone(),
        ));
        let (guard, graph, handles, mut record) = self.prepare(plan, previous)?;
        let graph = graph.into_shared();
        let env = guard.handle().clone();
        record.environment = Some(env.clone());
        record.phase = RunPhase::Executing;

        let mut run = Run {
            plan,
            guard: Some(guard),
            env,
            health: HealthMonitor::new(
                self.settings.health.clone(),
                dispatcher.clone(),
                self.vcs.clone(),
                graph.clone(),
            ),
            graph,
            dispatcher,
            handles,
            record,
            cancel,
        };
        info!(
            slug = %plan.slug,
            run = %run.record.run_id.short(),
            root = %run.env.root.display(),
            "run started"
        );

        let watcher = self.watch_abort_marker(&plan.slug, run.cancel.clone());
        let result = self.drive(&mut run).await;
        watcher.abort();
        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(slug = %plan.slug, error = %e, "run failed");
                self.stop_workers(&mut run).await;
                run.record.phase = RunPhase::Halted;
                run.record.halt_reason = Some(e.to_string());
                if let Err(save_err) = self.persist(&mut run).await {
                    warn!(error = %save_err, "could not persist failed run");
                }
                Err(e)
            }
        }
    }

    /// Pick up where an earlier run left off, or start a fresh one.
    fn prepare(
        &self,
        plan: &Plan,
        previous: Option<RunRecord>,
    ) -> Result<(EnvironmentGuard, TaskGraph, Vec<WorkerHandle>, RunRecord)> {
        let mut record = RunRecord::new(&plan.slug, plan.source.clone());
        if let Some(prev) = previous {
            let existing = prev.environment.clone().filter(|env| env.root.exists());
            if let Some(env) = existing {
                self.workspace.adopt(&env)?;
                let guard = EnvironmentGuard::new(self.workspace.clone(), env);
                if prev.can_rehydrate() {
                    let graph = TaskGraph::restore(prev.graph.clone())?;
                    let handles: Vec<WorkerHandle> =
                        prev.handles.iter().filter(|h| !h.is_terminal()).cloned().collect();
                    info!(
                        slug = %plan.slug,
                        run = %prev.run_id.short(),
                        handles = handles.len(),
                        "rehydrating run"
                    );
                    return Ok((guard, graph, handles, prev));
                }
                // A halted run left its environment for inspection; rerun in it.
                info!(slug = %plan.slug, phase = %prev.phase, "reusing preserved environment");
                record.artifact = prev.artifact;
                let graph = TaskGraph::from_plan(plan)?;
                return Ok((guard, graph, Vec::new(), record));
            }
            record.artifact = prev.artifact;
        }

        let graph = TaskGraph::from_plan(plan)?;
        let env = self
            .workspace
            .create(&plan.slug, plan.base_branch.as_deref())?;
        let guard = EnvironmentGuard::new(self.workspace.clone(), env);
        Ok((guard, graph, Vec::new(), record))
    }

    async fn drive(&self, run: &mut Run<'_>) -> Result<RunReport> {
        self.persist(run).await?;
        self.reconcile(run).await?;

        let exit = self.execute(run).await?;
        if !run.handles.is_empty() {
            self.stop_workers(run).await;
        }
        if exit == LoopExit::Aborted {
            return self.abort(run).await;
        }
        if let LoopExit::Halted(reason) = &exit {
            warn!(slug = %run.plan.slug, reason = %reason, "run halted by failure policy");
            run.record.halt_reason = Some(reason.clone());
        }

        run.record.phase = RunPhase::Gating;
        self.persist(run).await?;
        let pipeline = GatePipeline::new(
            self.gates.clone(),
            self.vcs.clone(),
            self.settings.scan_timeout,
        );
        let gates = {
            let graph = run.graph.read().await;
            pipeline.run(run.plan, &run.env, &graph).await
        };

        if let Some(failure) = gates.failure() {
            if let Some(err) = gates.to_error() {
                error!(error = %err, "run halted at gates");
            }
            if let Some(output) = &failure.output {
                error!(output = %tail(output, GATE_OUTPUT_LOG_CHARS), "gate output");
            }
            if !gates.skipped.is_empty() {
                info!(skipped = ?gates.skipped, "gates skipped");
            }
            run.record.phase = RunPhase::Halted;
            if run.record.halt_reason.is_none() {
                run.record.halt_reason = Some(format!("gate {} failed: {}", failure.name, failure.summary()));
            }
            self.persist(run).await?;
            let preserved = run.guard.take().map(|g| g.preserve().root);
            return Ok(self
                .report(run, RunStatus::GateFailed, Some(gates), None, preserved)
                .await);
        }

        let finalizer = Finalizer::new(
            self.vcs.clone(),
            self.tracker.clone(),
            self.store.clone(),
            self.settings.archive_dir.clone(),
        );
        run.record.graph = run.graph.read().await.snapshot();
        let outcome = {
            let graph = run.graph.read().await;
            finalizer
                .finalize(run.plan, &run.env, &graph, &gates, &mut run.record)
                .await?
        };

        if let Some(guard) = run.guard.take() {
            if let Err(e) = guard.release(Teardown::Full) {
                warn!(slug = %run.plan.slug, error = %e, "teardown after finalization failed");
            }
        }
        Ok(self
            .report(run, RunStatus::Finalized, Some(gates), Some(outcome), None)
            .await)
    }

    /// Fail tasks that were in flight when an earlier process died without a
    /// live worker handle for them.
    async fn reconcile(&self, run: &mut Run<'_>) -> Result<()> {
        let mut graph = run.graph.write().await;
        let orphans: Vec<_> = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| !run.handles.iter().any(|h| h.task_id == t.id))
            .map(|t| t.id.clone())
            .collect();
        for id in orphans {
            warn!(task = %id, "in-progress task has no worker handle, failing it");
            graph.fail(&id, "worker lost while the orchestrator was down")?;
            graph.block_dependents(&id);
        }
        Ok(())
    }

    async fn execute(&self, run: &mut Run<'_>) -> Result<LoopExit> {
        loop {
            if self.abort_requested(run) {
                return Ok(LoopExit::Aborted);
            }
            if let Some(reason) = halt_reason(run.plan, &*run.graph.read().await) {
                return Ok(LoopExit::Halted(reason));
            }

            let started = self.start_ready(run).await?;

            let reports = run.health.tick(&mut run.handles, &run.env, Utc::now()).await;
            for report in &reports {
                if report.is_final() {
                    info!(task = %report.task_id, action = ?report.action, "worker finished");
                } else {
                    debug!(
                        task = %report.task_id,
                        status = %report.status,
                        action = ?report.action,
                        silent_secs = report.silent_secs,
                        "health"
                    );
                }
            }
            self.reap(run).await;
            self.persist(run).await?;

            if let Some(reason) = halt_reason(run.plan, &*run.graph.read().await) {
                return Ok(LoopExit::Halted(reason));
            }
            {
                let graph = run.graph.read().await;
                if graph.is_settled() {
                    info!(summary = %graph.summary(), "all tasks settled");
                    return Ok(LoopExit::Settled);
                }
            }
            if started == 0 {
                tokio::select! {
                    _ = run.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.dispatch.poll_interval) => {}
                }
            }
        }
    }

    /// Dispatch every ready task. Returns how many were started.
    async fn start_ready(&self, run: &mut Run<'_>) -> Result<usize> {
        let ready: Vec<Task> = {
            let mut graph = run.graph.write().await;
            let newly: Vec<_> = graph.ready_tasks().iter().map(|t| t.id.clone()).collect();
            for id in &newly {
                graph.transition(id, TaskStatus::Ready)?;
            }
            graph
                .tasks()
                .filter(|t| t.status == TaskStatus::Ready)
                .cloned()
                .collect()
        };
        if ready.is_empty() {
            return Ok(0);
        }

        let (parallel, sequential): (Vec<Task>, Vec<Task>) =
            ready.into_iter().partition(|t| t.parallel);
        let mut started = 0;
        for task in &parallel {
            self.launch(run, task, true).await?;
            started += 1;
        }
        if !parallel.is_empty() {
            self.persist(run).await?;
        }
        for task in &sequential {
            if self.abort_requested(run)
                || halt_reason(run.plan, &*run.graph.read().await).is_some()
            {
                break;
            }
            self.launch(run, task, false).await?;
            started += 1;
        }
        Ok(started)
    }

    /// Dispatch one task. Dispatch errors fail only that task.
    async fn launch(&self, run: &mut Run<'_>, task: &Task, background: bool) -> Result<()> {
        run.graph
            .write()
            .await
            .transition(&task.id, TaskStatus::InProgress)?;
        let worker_type = run.plan.worker_type(&task.role);
        let handle = match run
            .dispatcher
            .start(task, &run.env, worker_type, background)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(task = %task.id, error = %e, "dispatch failed");
                let mut graph = run.graph.write().await;
                graph.fail(&task.id, &e.to_string())?;
                let blocked = graph.block_dependents(&task.id);
                if !blocked.is_empty() {
                    info!(task = %task.id, blocked = ?blocked, "dependents blocked");
                }
                return Ok(());
            }
        };
        run.graph
            .write()
            .await
            .assign(&task.id, &handle.agent_id)?;
        info!(task = %task.id, agent = %handle.agent_id, background, "task dispatched");
        run.handles.push(handle);
        if background {
            return Ok(());
        }

        self.persist(run).await?;
        let idx = run.handles.len() - 1;
        run.dispatcher.wait(&mut run.handles[idx]).await;
        let report = run
            .health
            .evaluate(&mut run.handles[idx], &run.env, Utc::now())
            .await;
        if let HealthAction::Failed { reason } = &report.action {
            warn!(task = %task.id, reason = %reason, "synchronous task failed");
        }
        self.reap(run).await;
        self.persist(run).await
    }

    /// Drop terminal handles and release their workers.
    async fn reap(&self, run: &mut Run<'_>) {
        let (done, live): (Vec<WorkerHandle>, Vec<WorkerHandle>) =
            run.handles.drain(..).partition(|h| h.is_terminal());
        run.handles = live;
        for handle in done {
            if let Err(e) = self.runtime.release(&handle.agent_id).await {
                warn!(agent = %handle.agent_id, error = %e, "could not release worker");
            }
        }
    }

    /// One safety commit for the shared environment, then release every live
    /// worker concurrently.
    async fn stop_workers(&self, run: &mut Run<'_>) {
        let live: Vec<WorkerHandle> = run.handles.drain(..).filter(|h| !h.is_terminal()).collect();
        if live.is_empty() {
            return;
        }
        let tasks: Vec<String> = live.iter().map(|h| h.task_id.to_string()).collect();
        info!(tasks = ?tasks, "stopping live workers");
        let message = format!(
            "baton: safety commit for {} ({})",
            run.plan.display_name(),
            tasks.join(", ")
        );
        safety_commit(
            self.vcs.clone(),
            &run.env,
            message,
            self.settings.health.safety_commit_timeout,
        )
        .await;

        let releases = join_all(live.iter().map(|h| self.runtime.release(&h.agent_id))).await;
        for (handle, result) in live.iter().zip(releases) {
            if let Err(e) = result {
                warn!(agent = %handle.agent_id, error = %e, "could not release worker");
            }
        }
    }

    async fn abort(&self, run: &mut Run<'_>) -> Result<RunReport> {
        warn!(slug = %run.plan.slug, "run aborted");
        run.record.phase = RunPhase::Aborted;
        run.record.halt_reason = Some("aborted by operator".to_string());
        self.persist(run).await?;
        if let Err(e) = self.store.clear_abort(&run.plan.slug) {
            warn!(error = %e, "could not clear abort marker");
        }
        if let Some(guard) = run.guard.take() {
            if let Err(e) = guard.release(Teardown::KeepBranch) {
                warn!(slug = %run.plan.slug, error = %e, "teardown after abort failed");
            }
        }
        Ok(self.report(run, RunStatus::Aborted, None, None, None).await)
    }

    fn abort_requested(&self, run: &Run<'_>) -> bool {
        run.cancel.is_cancelled() || self.store.abort_requested(&run.plan.slug)
    }

    /// Cancel the run when `baton abort` drops its marker, so a synchronous
    /// wait notices it too.
    fn watch_abort_marker(&self, slug: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let slug = slug.to_string();
        let interval = self.settings.dispatch.poll_interval;
        tokio::spawn(async move {
            loop {
                if store.abort_requested(&slug) {
                    info!(slug = %slug, "abort requested");
                    cancel.cancel();
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    async fn persist(&self, run: &mut Run<'_>) -> Result<()> {
        run.record.graph = run.graph.read().await.snapshot();
        run.record.handles = run.handles.iter().filter(|h| !h.is_terminal()).cloned().collect();
        run.record.touch();
        self.store.save(&run.record)
    }

    async fn report(
        &self,
        run: &Run<'_>,
        status: RunStatus,
        gates: Option<GateReport>,
        finalize: Option<FinalizeOutcome>,
        preserved: Option<PathBuf>,
    ) -> RunReport {
        let graph = run.graph.read().await;
        RunReport {
            run_id: run.record.run_id,
            slug: run.plan.slug.clone(),
            status,
            summary: graph.summary(),
            tasks: graph.snapshot(),
            gates,
            finalize,
            preserved,
            halt_reason: run.record.halt_reason.clone(),
        }
    }
}

/// Why the failure policy stops the run, if it does.
///
/// Optional tasks never halt a run; `continue_on_failure` lets unaffected
/// branches keep going.
fn halt_reason(plan: &Plan, graph: &TaskGraph) -> Option<String> {
    if plan.policy.continue_on_failure {
        return None;
    }
    let failed: Vec<String> = graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Failed && !t.optional)
        .map(|t| t.id.to_string())
        .collect();
    if failed.is_empty() {
        None
    } else {
        Some(format!("task {} failed", failed.join(", ")))
    }
}

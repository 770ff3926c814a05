//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted workers, version control and gate commands
//! - Writing plan documents and building an orchestrator around the fakes

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use baton::docs::DocCandidate;
use baton::orchestration::{
    CommandOutput, DispatchConfig, GateCommands, HealthConfig, Invocation, Orchestrator,
    RunSettings, TerminalStatus, Tracker, WorkerPoll, WorkerRequest, WorkerRuntime,
};
use baton::plan::Plan;
use baton::state::RunStore;
use baton::vcs::{ChangeKind, ChangedFile, VersionControl, Worktree};
use baton::{Error, Result};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo directory");

        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            git(&path, &args);
        }

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Directory next to the repository for worktrees.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        let output = Command::new("git")
            .args(["branch", "--list", name])
            .current_dir(&self.path)
            .output()
            .expect("Failed to list branches");

        !String::from_utf8_lossy(&output.stdout).trim().is_empty()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// How a scripted worker behaves.
#[derive(Debug, Clone)]
pub enum Script {
    /// Terminal and successful after this many polls.
    CompleteAfter(usize),
    /// Terminal with a failure after this many polls.
    FailAfter(usize, String),
    /// Never terminal; output stopped at the given time.
    Silent(DateTime<Utc>),
    /// Never terminal; output keeps flowing.
    Busy,
}

#[derive(Default)]
struct RuntimeState {
    scripts: HashMap<String, Script>,
    refuse_resume: bool,
    refuse_invoke: Vec<String>,
    polls: HashMap<String, usize>,
    events: Vec<String>,
    requests: Vec<WorkerRequest>,
    resumes: Vec<String>,
    released: Vec<String>,
}

/// Worker runtime driven by per-task scripts.
///
/// Agent ids are `<task>-<n>`; tasks without a script complete on the
/// first poll. Every invoke and terminal poll is appended to an event log
/// so tests can check ordering.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    counter: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, task: &str, script: Script) {
        self.lock().scripts.insert(task.to_string(), script);
    }

    pub fn refuse_resume(&self) {
        self.lock().refuse_resume = true;
    }

    /// Make every invocation for `task` fail.
    pub fn refuse_invoke(&self, task: &str) {
        self.lock().refuse_invoke.push(task.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.lock().requests.clone()
    }

    pub fn invoked_tasks(&self) -> Vec<String> {
        self.lock()
            .requests
            .iter()
            .map(|r| r.task_id.to_string())
            .collect()
    }

    pub fn resumes(&self) -> Vec<String> {
        self.lock().resumes.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    /// Position of `event` in the log.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.lock().events.iter().position(|e| e == event)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }
}

fn task_of(agent_id: &str) -> &str {
    agent_id.rsplit_once('-').map(|(task, _)| task).unwrap_or(agent_id)
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn invoke(&self, request: &WorkerRequest) -> Result<Invocation> {
        let task = request.task_id.to_string();
        let mut state = self.lock();
        if state.refuse_invoke.contains(&task) {
            state.events.push(format!("refused:{}", task));
            return Err(Error::Dispatch {
                task,
                message: "worker binary missing".to_string(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        state.events.push(format!("invoke:{}", task));
        state.requests.push(request.clone());
        Ok(Invocation {
            agent_id: format!("{}-{}", task, n),
            background: request.background,
        })
    }

    async fn poll(&self, agent_id: &str) -> Result<WorkerPoll> {
        let task = task_of(agent_id).to_string();
        let mut state = self.lock();
        let polls = {
            let count = state.polls.entry(agent_id.to_string()).or_default();
            *count += 1;
            *count
        };
        let script = state
            .scripts
            .get(&task)
            .cloned()
            .unwrap_or(Script::CompleteAfter(1));

        let (last_output_at, terminal_status) = match script {
            Script::CompleteAfter(n) if polls >= n => (Utc::now(), Some(TerminalStatus::Completed)),
            Script::FailAfter(n, reason) if polls >= n => {
                (Utc::now(), Some(TerminalStatus::Failed { reason }))
            }
            Script::Silent(at) => (at, None),
            _ => (Utc::now(), None),
        };
        if terminal_status.is_some() {
            state.events.push(format!("done:{}", task));
        }
        Ok(WorkerPoll {
            last_output_at,
            terminal: terminal_status.is_some(),
            terminal_status,
        })
    }

    async fn resume(&self, agent_id: &str) -> Result<bool> {
        let mut state = self.lock();
        state.resumes.push(agent_id.to_string());
        Ok(!state.refuse_resume)
    }

    async fn release(&self, agent_id: &str) -> Result<()> {
        self.lock().released.push(agent_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct VcsState {
    worktrees_created: usize,
    worktrees_removed: usize,
    branches_deleted: Vec<String>,
    commits: Vec<String>,
    pushes: usize,
    opened: Vec<String>,
    existing_artifact: Option<String>,
    changed: Vec<ChangedFile>,
    commit_delay: Duration,
}

/// Version control that keeps worktrees as plain directories and counts
/// every remote-facing call.
pub struct FakeVcs {
    dir: PathBuf,
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(VcsState {
                changed: vec![
                    changed("src/lib.rs", ChangeKind::Modified),
                    changed("docs/usage.md", ChangeKind::Modified),
                ],
                ..Default::default()
            }),
        })
    }

    /// An artifact already published by an earlier run.
    pub fn with_existing_artifact(&self, url: &str) {
        self.lock().existing_artifact = Some(url.to_string());
    }

    pub fn set_changed(&self, files: Vec<ChangedFile>) {
        self.lock().changed = files;
    }

    /// Make every commit block for `delay` before it is recorded.
    pub fn slow_commits(&self, delay: Duration) {
        self.lock().commit_delay = delay;
    }

    pub fn worktrees_created(&self) -> usize {
        self.lock().worktrees_created
    }

    pub fn worktrees_removed(&self) -> usize {
        self.lock().worktrees_removed
    }

    pub fn branches_deleted(&self) -> Vec<String> {
        self.lock().branches_deleted.clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    pub fn pushes(&self) -> usize {
        self.lock().pushes
    }

    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VcsState> {
        self.state.lock().unwrap()
    }
}

pub fn changed(path: &str, kind: ChangeKind) -> ChangedFile {
    ChangedFile {
        path: path.to_string(),
        kind,
    }
}

impl VersionControl for FakeVcs {
    fn worktree_path(&self, slug: &str) -> PathBuf {
        self.dir.join(slug)
    }

    fn branch_exists(&self, _branch: &str) -> Result<bool> {
        Ok(false)
    }

    fn create_worktree(&self, slug: &str, branch: &str, _base: Option<&str>) -> Result<Worktree> {
        let path = self.worktree_path(slug);
        std::fs::create_dir_all(&path)?;
        self.lock().worktrees_created += 1;
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            base_commit: "base".to_string(),
        })
    }

    fn commit_all(&self, _path: &Path, message: &str) -> bool {
        let delay = self.lock().commit_delay;
        std::thread::sleep(delay);
        self.lock().commits.push(message.to_string());
        true
    }

    fn push(&self, _path: &Path, _branch: &str) -> Result<()> {
        self.lock().pushes += 1;
        Ok(())
    }

    fn open_change_artifact(&self, _: &Path, branch: &str, _title: &str, body: &str) -> Result<String> {
        let mut state = self.lock();
        let url = format!("https://example.test/pulls/{}", state.opened.len() + 1);
        state.opened.push(body.to_string());
        state.existing_artifact = Some(url.clone());
        assert!(branch.starts_with("baton/"));
        Ok(url)
    }

    fn find_change_artifact(&self, _: &Path, _: &str, _key: &str) -> Result<Option<String>> {
        Ok(self.lock().existing_artifact.clone())
    }

    fn changed_files(&self, _: &Path, _: &str) -> Result<Vec<ChangedFile>> {
        Ok(self.lock().changed.clone())
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.lock().worktrees_removed += 1;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.lock().branches_deleted.push(branch.to_string());
        Ok(())
    }
}

/// Gate commands with a configurable build result and scan.
pub struct FakeGates {
    pub build_exit: i32,
    pub scan_delay: Duration,
    pub candidates: Vec<DocCandidate>,
    pub builds: AtomicUsize,
    pub scans_finished: AtomicUsize,
}

impl FakeGates {
    pub fn passing() -> Self {
        Self {
            build_exit: 0,
            scan_delay: Duration::ZERO,
            candidates: Vec::new(),
            builds: AtomicUsize::new(0),
            scans_finished: AtomicUsize::new(0),
        }
    }

    pub fn failing_build() -> Self {
        Self {
            build_exit: 101,
            ..Self::passing()
        }
    }
}

#[async_trait]
impl GateCommands for FakeGates {
    async fn build_and_test(&self, _root: &Path) -> Result<CommandOutput> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(CommandOutput {
            exit_code: self.build_exit,
            output: format!("test result: exit {}", self.build_exit),
        })
    }

    async fn scan_docs(&self, _root: &Path, _changed: &[ChangedFile]) -> Result<Vec<DocCandidate>> {
        tokio::time::sleep(self.scan_delay).await;
        self.scans_finished.fetch_add(1, Ordering::SeqCst);
        Ok(self.candidates.clone())
    }
}

/// Tracker that remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingTracker {
    pub closed: Mutex<Vec<String>>,
    pub follow_ups: Mutex<Vec<String>>,
}

impl Tracker for RecordingTracker {
    fn close(&self, reference: &str) -> Result<()> {
        self.closed.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    fn raise_follow_up(&self, title: &str, _body: &str) -> Result<()> {
        self.follow_ups.lock().unwrap().push(title.to_string());
        Ok(())
    }
}

/// Run settings with millisecond polling and real-world health thresholds.
pub fn fast_settings(archive_dir: &Path) -> RunSettings {
    RunSettings {
        dispatch: DispatchConfig {
            retries: 1,
            backoff: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            failure_threshold: Duration::from_secs(15 * 60),
        },
        health: HealthConfig {
            safety_commit_timeout: Duration::from_secs(5),
            ..HealthConfig::default()
        },
        scan_timeout: Duration::from_secs(5),
        archive_dir: archive_dir.to_path_buf(),
    }
}

/// Everything one orchestrated run needs, rooted in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub vcs: Arc<FakeVcs>,
    pub gates: Arc<FakeGates>,
    pub tracker: Arc<RecordingTracker>,
    pub store: RunStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gates(FakeGates::passing())
    }

    pub fn with_gates(gates: FakeGates) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let vcs = FakeVcs::new(&dir.path().join("worktrees"));
        Self {
            runtime: FakeRuntime::new(),
            vcs,
            gates: Arc::new(gates),
            tracker: Arc::new(RecordingTracker::default()),
            store: RunStore::new(dir.path().join("runs")),
            dir,
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.path().join("archive")
    }

    /// Write `content` as `<slug>.toml` and load it.
    pub fn plan(&self, slug: &str, content: &str) -> Plan {
        let plans = self.dir.path().join("plans");
        std::fs::create_dir_all(&plans).expect("Failed to create plans dir");
        let path = plans.join(format!("{}.toml", slug));
        std::fs::write(&path, content).expect("Failed to write plan");
        Plan::load(&path).expect("Failed to load plan")
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(fast_settings(&self.archive_dir()))
    }

    pub fn orchestrator_with(&self, settings: RunSettings) -> Orchestrator {
        Orchestrator::new(
            settings,
            self.runtime.clone(),
            self.vcs.clone(),
            self.gates.clone(),
            self.tracker.clone(),
            self.store.clone(),
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A, B in parallel; C after both.
pub const FAN_IN: &str = r#"
tracking_reference = "ENG-7"

[[tasks]]
id = "A"
subject = "schema"
parallel = true

[[tasks]]
id = "B"
subject = "handlers"
parallel = true

[[tasks]]
id = "C"
subject = "wire up"
depends_on = ["A", "B"]
"#;

/// A -> B -> C, all sequential.
pub const CHAIN: &str = r#"
[[tasks]]
id = "A"

[[tasks]]
id = "B"
depends_on = ["A"]

[[tasks]]
id = "C"
depends_on = ["B"]
"#;

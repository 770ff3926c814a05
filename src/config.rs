use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Default worker command; the task instructions are appended as the last argument.
pub const DEFAULT_WORKER_COMMAND: &str = "claude --dangerously-skip-permissions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where plan environments (worktrees) are created.
    pub worktree_dir: Option<String>,
    /// Where `run <tracking-id>` looks for plan documents.
    pub plans_dir: String,
    /// Where finalized plan documents are moved.
    pub archive_dir: Option<String>,
    /// Remote environment branches are pushed to.
    pub remote: String,
    /// Worker command per role; `default` is used for unknown roles.
    pub worker: WorkerConfig,
    pub health: HealthSettings,
    pub dispatch: DispatchSettings,
    pub gates: GateSettings,
    /// Upper bound on waiting for in-flight safety commits during an abort.
    pub safety_commit_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    /// Text sent to a stalled worker when resuming it.
    pub resume_prompt: String,
    /// Per worker-type overrides, keyed by the plan's `team_members` values.
    pub commands: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub warning_threshold_secs: u64,
    pub failure_threshold_secs: u64,
    pub resume_grace_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Shell command run in the environment root; exit 0 passes.
    pub build_command: String,
    pub build_timeout_secs: u64,
    /// Directories (relative to the environment root) scanned for cross references.
    pub doc_roots: Vec<String>,
    pub scan_timeout_secs: u64,
    /// Maximum number of advisory documents reported.
    pub max_candidates: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worktree_dir: None,
            plans_dir: "plans".to_string(),
            archive_dir: None,
            remote: "origin".to_string(),
            worker: WorkerConfig::default(),
            health: HealthSettings::default(),
            dispatch: DispatchSettings::default(),
            gates: GateSettings::default(),
            safety_commit_timeout_secs: 30,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_WORKER_COMMAND.to_string(),
            resume_prompt: "continue".to_string(),
            commands: Default::default(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            warning_threshold_secs: 5 * 60,
            failure_threshold_secs: 15 * 60,
            resume_grace_secs: 60,
            poll_interval_secs: 10,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 500,
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            build_command: "cargo test".to_string(),
            build_timeout_secs: 30 * 60,
            doc_roots: vec!["docs".to_string(), ".".to_string()],
            scan_timeout_secs: 60,
            max_candidates: 10,
        }
    }
}

impl Config {
    pub fn baton_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".baton"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::baton_dir()?.join("baton.toml"))
    }

    pub fn runs_dir() -> Result<PathBuf> {
        Ok(Self::baton_dir()?.join("runs"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::baton_dir()?.join("worktrees")),
        }
    }

    pub fn archive_path(&self) -> Result<PathBuf> {
        match &self.archive_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::baton_dir()?.join("archive")),
        }
    }

    /// Plans directory; relative paths are taken from the repository root.
    pub fn plans_path(&self, repo: &Path) -> PathBuf {
        repo.join(expand_tilde(&self.plans_dir))
    }

    /// Command line used for a worker type, falling back to the default command.
    pub fn worker_command(&self, worker_type: Option<&str>) -> &str {
        worker_type
            .and_then(|t| self.worker.commands.get(t))
            .map(String::as_str)
            .unwrap_or(&self.worker.command)
    }

    pub fn safety_commit_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_commit_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let h = &self.health;
        if h.warning_threshold_secs >= h.failure_threshold_secs {
            return Err(Error::Validation(format!(
                "health.warning_threshold_secs ({}) must be below failure_threshold_secs ({})",
                h.warning_threshold_secs, h.failure_threshold_secs
            )));
        }
        if h.poll_interval_secs == 0 {
            return Err(Error::Validation(
                "health.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.worker.command.trim().is_empty() {
            return Err(Error::Validation("worker.command cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            Self::baton_dir()?,
            Self::runs_dir()?,
            self.worktrees_dir()?,
            self.archive_path()?,
        ] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

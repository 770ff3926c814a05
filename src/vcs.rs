//! Version-control boundary.
//!
//! The orchestrator only talks to [`VersionControl`]. [`GitVcs`] implements it
//! with git2 for local work and the `git`/`gh` command line tools for the
//! remote side (push and pull requests).

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::git::GitOps;
use crate::{Error, Result};

/// A checked out environment branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
}

/// One path in the environment diff, relative to the environment root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub kind: ChangeKind,
}

/// Operations the orchestrator needs from version control.
///
/// All methods are blocking; async callers go through `util::blocking`.
pub trait VersionControl: Send + Sync {
    /// Directory an environment for `slug` would live in.
    fn worktree_path(&self, slug: &str) -> PathBuf;

    fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Check out `branch` in a new worktree, creating the branch from
    /// `base_branch` (or HEAD) when it does not exist yet.
    fn create_worktree(&self, slug: &str, branch: &str, base_branch: Option<&str>)
        -> Result<Worktree>;

    /// Commit everything in `path`. Never fails: problems are logged and
    /// reported as `false`.
    fn commit_all(&self, path: &Path, message: &str) -> bool;

    fn push(&self, path: &Path, branch: &str) -> Result<()>;

    fn open_change_artifact(&self, path: &Path, branch: &str, title: &str, body: &str)
        -> Result<String>;

    /// Look up an existing artifact for `branch` whose body carries `key`.
    fn find_change_artifact(&self, path: &Path, branch: &str, key: &str)
        -> Result<Option<String>>;

    fn changed_files(&self, path: &Path, base_commit: &str) -> Result<Vec<ChangedFile>>;

    fn remove_worktree(&self, path: &Path) -> Result<()>;

    fn delete_branch(&self, branch: &str) -> Result<()>;
}

pub struct GitVcs {
    git: GitOps,
    worktrees_dir: PathBuf,
    remote: String,
}

impl GitVcs {
    pub fn new(repo_path: &Path, worktrees_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            git: GitOps::new(repo_path)?,
            worktrees_dir,
            remote: "origin".to_string(),
        })
    }

    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.to_string();
        self
    }

    fn repo_name(&self) -> String {
        self.git
            .repo_path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo")
            .to_string()
    }
}

/// Run a command in `dir`, returning trimmed stdout or a finalization error
/// carrying stderr.
fn run_tool(program: &str, args: &[&str], dir: &Path) -> Result<String> {
    debug!(program, ?args, dir = %dir.display(), "running");
    let output = Command::new(program).args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Finalization(format!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Deserialize)]
struct PullRequest {
    url: String,
    #[serde(default)]
    body: String,
}

impl VersionControl for GitVcs {
    fn worktree_path(&self, slug: &str) -> PathBuf {
        self.worktrees_dir
            .join(format!("{}-{}", self.repo_name(), slug))
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.git.branch_exists(branch)
    }

    fn create_worktree(
        &self,
        slug: &str,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<Worktree> {
        std::fs::create_dir_all(&self.worktrees_dir)?;
        let path = self.worktree_path(slug);
        // A branch left by an aborted run still carries its safety commits.
        let base_commit = if self.git.branch_exists(branch)? {
            self.git.attach_worktree(branch, &path, base_branch)?
        } else {
            self.git.create_worktree(branch, &path, base_branch)?
        };
        Ok(Worktree {
            path,
            branch: branch.to_string(),
            base_commit,
        })
    }

    fn commit_all(&self, path: &Path, message: &str) -> bool {
        if !path.exists() {
            return false;
        }
        match self.git.commit_all(path, message) {
            Ok(committed) => committed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "commit failed");
                false
            }
        }
    }

    fn push(&self, path: &Path, branch: &str) -> Result<()> {
        run_tool("git", &["push", "--set-upstream", &self.remote, branch], path)?;
        info!(branch, remote = %self.remote, "branch pushed");
        Ok(())
    }

    fn open_change_artifact(
        &self,
        path: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let url = run_tool(
            "gh",
            &["pr", "create", "--head", branch, "--title", title, "--body", body],
            path,
        )?;
        // gh prints progress lines before the URL.
        let url = url.lines().last().unwrap_or_default().trim().to_string();
        info!(branch, url = %url, "pull request opened");
        Ok(url)
    }

    fn find_change_artifact(&self, path: &Path, branch: &str, key: &str) -> Result<Option<String>> {
        let json = run_tool(
            "gh",
            &[
                "pr", "list", "--head", branch, "--state", "all", "--json", "url,body",
            ],
            path,
        )?;
        if json.is_empty() {
            return Ok(None);
        }
        let prs: Vec<PullRequest> = serde_json::from_str(&json)?;
        Ok(prs.into_iter().find(|pr| pr.body.contains(key)).map(|pr| pr.url))
    }

    fn changed_files(&self, path: &Path, base_commit: &str) -> Result<Vec<ChangedFile>> {
        self.git.changed_files(path, base_commit)
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        self.git.remove_worktree(path)
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git.delete_branch(branch)
    }
}

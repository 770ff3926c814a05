//! Isolated execution environments.
//!
//! One environment per plan run: a worktree on the branch `baton/<slug>`
//! shared by every task of the run. [`EnvironmentGuard`] ties teardown to
//! scope so every exit path cleans up unless the environment is explicitly
//! preserved for inspection.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::vcs::VersionControl;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub slug: String,
    pub root: PathBuf,
    pub branch: String,
    /// Commit the diff for the gates is taken against.
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
}

/// How much of an environment to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Remove the worktree and delete the local branch.
    Full,
    /// Remove the worktree, keep the branch (and any safety commits on it).
    KeepBranch,
}

pub struct WorkspaceManager {
    vcs: Arc<dyn VersionControl>,
    active: Mutex<HashSet<String>>,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            vcs,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn branch_for(slug: &str) -> String {
        format!("baton/{}", slug)
    }

    pub fn is_active(&self, slug: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(slug)
    }

    /// Allocate the environment for `slug`.
    ///
    /// Fails with `EnvironmentExists` when the slug is already running in
    /// this process or its worktree directory is present on disk.
    pub fn create(&self, slug: &str, base_branch: Option<&str>) -> Result<EnvironmentHandle> {
        let path = self.vcs.worktree_path(slug);
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains(slug) || path.exists() {
                warn!(slug, path = %path.display(), "environment already exists");
                return Err(Error::EnvironmentExists(slug.to_string()));
            }
            // Claim before the slow VCS call so a concurrent create sees it.
            active.insert(slug.to_string());
        }

        let branch = Self::branch_for(slug);
        match self.vcs.create_worktree(slug, &branch, base_branch) {
            Ok(worktree) => {
                info!(slug, root = %worktree.path.display(), branch = %worktree.branch, "environment created");
                Ok(EnvironmentHandle {
                    slug: slug.to_string(),
                    root: worktree.path,
                    branch: worktree.branch,
                    base_commit: worktree.base_commit,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                self.release_slug(slug);
                Err(e)
            }
        }
    }

    /// Re-register an environment restored from a run record.
    pub fn adopt(&self, handle: &EnvironmentHandle) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(handle.slug.clone()) {
            return Err(Error::EnvironmentExists(handle.slug.clone()));
        }
        debug!(slug = %handle.slug, "adopted existing environment");
        Ok(())
    }

    /// Remove the environment. Idempotent: tearing down an environment that
    /// is already gone is a no-op.
    pub fn destroy(&self, handle: &EnvironmentHandle, mode: Teardown) -> Result<()> {
        let was_active = self.is_active(&handle.slug);
        if !was_active && !handle.root.exists() {
            debug!(slug = %handle.slug, "environment already destroyed");
            return Ok(());
        }

        if handle.root.exists() {
            self.vcs.remove_worktree(&handle.root)?;
        }
        if mode == Teardown::Full {
            self.vcs.delete_branch(&handle.branch)?;
        }
        self.release_slug(&handle.slug);
        info!(slug = %handle.slug, ?mode, "environment destroyed");
        Ok(())
    }

    fn release_slug(&self, slug: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(slug);
    }
}

/// Scoped owner of a run's environment.
///
/// Dropping the guard removes the worktree (keeping the branch) unless
/// [`preserve`](Self::preserve) was called. [`release`](Self::release) tears
/// down fully after a successful finalization.
pub struct EnvironmentGuard {
    manager: Arc<WorkspaceManager>,
    handle: EnvironmentHandle,
    preserved: bool,
    released: bool,
}

impl EnvironmentGuard {
    pub fn new(manager: Arc<WorkspaceManager>, handle: EnvironmentHandle) -> Self {
        Self {
            manager,
            handle,
            preserved: false,
            released: false,
        }
    }

    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    /// Leave the environment on disk for inspection.
    pub fn preserve(mut self) -> EnvironmentHandle {
        self.preserved = true;
        info!(root = %self.handle.root.display(), "environment preserved for inspection");
        self.handle.clone()
    }

    pub fn release(mut self, mode: Teardown) -> Result<()> {
        self.released = true;
        self.manager.destroy(&self.handle, mode)
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.preserved || self.released {
            return;
        }
        if let Err(e) = self.manager.destroy(&self.handle, Teardown::KeepBranch) {
            warn!(slug = %self.handle.slug, error = %e, "environment teardown failed");
        }
    }
}

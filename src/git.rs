use std::path::{Path, PathBuf};

use git2::{Delta, DiffFindOptions, DiffOptions, ErrorCode, IndexAddOption, Repository, Signature};
use tracing::{debug, warn};

use crate::vcs::{ChangeKind, ChangedFile};
use crate::Result;

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "opening repository");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create `branch` from `base` (or HEAD) and check it out at `worktree_path`.
    ///
    /// Returns the commit the branch was created from.
    pub fn create_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base: Option<&str>,
    ) -> Result<String> {
        debug!(branch, path = %worktree_path.display(), ?base, "creating worktree");
        let repo = self.repo()?;
        let commit = match base {
            Some(base) => repo.revparse_single(base)?.peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };
        let base_commit = commit.id().to_string();
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a valid worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        debug!(branch, commit = %base_commit, "worktree created");
        Ok(base_commit)
    }

    /// Check out an existing `branch` at `worktree_path`.
    ///
    /// Returns the merge base of the branch and `base` (or HEAD), so the diff
    /// still covers everything done on the branch.
    pub fn attach_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base: Option<&str>,
    ) -> Result<String> {
        debug!(branch, path = %worktree_path.display(), "attaching worktree to existing branch");
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let tip = reference.peel_to_commit()?.id();
        let base_oid = match base {
            Some(base) => repo.revparse_single(base)?.peel_to_commit()?.id(),
            None => repo.head()?.peel_to_commit()?.id(),
        };
        let merge_base = repo.merge_base(tip, base_oid)?;

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(merge_base.to_string())
    }

    /// Remove a worktree and its admin directory. Missing pieces are skipped,
    /// so calling this twice is harmless.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "removing worktree");
        if worktree_path.exists() && self.is_dirty(worktree_path).unwrap_or(false) {
            warn!(path = %worktree_path.display(), "removing worktree with uncommitted changes");
        }
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || Some(*name) == folder_name.as_deref()
            })
            .map(str::to_string);

        if let Some(name) = &worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir makes git think the branch is still checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                debug!(dir = %admin_dir.display(), "cleaning worktree admin dir");
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Stage everything and commit. Returns `false` when there was nothing
    /// to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<bool> {
        debug!(path = %worktree_path.display(), message, "commit all");
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().map(|p| p.tree_id()) == Some(tree_id) {
            debug!("nothing to commit");
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("baton", "baton@localhost"))?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "commit created");
        Ok(true)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Delete a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    warn!(branch, error = %e, "failed to delete branch");
                } else {
                    debug!(branch, "branch deleted");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(branch, "branch already gone");
            }
            Err(e) => warn!(branch, error = %e, "error looking up branch"),
        }
        Ok(())
    }

    /// Check if a worktree has uncommitted changes (staged or unstaged).
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Files changed in the worktree (committed or not) relative to `base_commit`.
    pub fn changed_files(&self, worktree_path: &Path, base_commit: &str) -> Result<Vec<ChangedFile>> {
        let repo = Repository::open(worktree_path)?;
        let base_tree = repo.revparse_single(base_commit)?.peel_to_tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let mut diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true).for_untracked(true)))?;

        let path_of = |file: git2::DiffFile<'_>| {
            file.path()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default()
        };

        let mut changed = Vec::new();
        for delta in diff.deltas() {
            let kind = match delta.status() {
                Delta::Added | Delta::Untracked | Delta::Copied => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Renamed => ChangeKind::Renamed {
                    from: path_of(delta.old_file()),
                },
                Delta::Modified | Delta::Typechange => ChangeKind::Modified,
                _ => continue,
            };
            let path = match kind {
                ChangeKind::Deleted => path_of(delta.old_file()),
                _ => path_of(delta.new_file()),
            };
            changed.push(ChangedFile { path, kind });
        }
        debug!(count = changed.len(), base = base_commit, "collected changed files");
        Ok(changed)
    }
}

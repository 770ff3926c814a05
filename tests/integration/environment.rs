//! Environment lifecycle tests.
//!
//! One environment per plan run, shared by every task, torn down exactly
//! once no matter how many exit paths try.

use std::sync::Arc;

use baton::vcs::{ChangeKind, GitVcs, VersionControl};
use baton::workspace::{EnvironmentGuard, Teardown, WorkspaceManager};
use baton::Error;

use crate::fixtures::{FakeVcs, Harness, TestRepo, FAN_IN};

/// Test: Single environment per run
/// Given a plan with three tasks
/// When the run completes
/// Then exactly one environment was created and every worker ran in it
#[tokio::test]
async fn test_every_task_runs_in_one_environment() {
    let harness = Harness::new();
    let plan = harness.plan("fan-in", FAN_IN);

    harness.orchestrator().run(&plan).await.unwrap();

    assert_eq!(harness.vcs.worktrees_created(), 1);
    let requests = harness.runtime.requests();
    assert_eq!(requests.len(), 3);
    let root = harness.vcs.worktree_path("fan-in");
    assert!(requests.iter().all(|r| r.root == root));
}

/// Test: Teardown idempotency
/// Given a created environment
/// When it is destroyed twice, then its guard drops
/// Then the worktree is removed once and nothing fails
#[test]
fn test_teardown_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let vcs = FakeVcs::new(dir.path());
    let manager = Arc::new(WorkspaceManager::new(vcs.clone()));

    let env = manager.create("plan", None).unwrap();
    let guard = EnvironmentGuard::new(manager.clone(), env.clone());

    manager.destroy(&env, Teardown::Full).unwrap();
    manager.destroy(&env, Teardown::Full).unwrap();
    drop(guard);

    assert_eq!(vcs.worktrees_removed(), 1);
    assert_eq!(vcs.branches_deleted(), vec!["baton/plan".to_string()]);
    assert!(!manager.is_active("plan"));
}

/// Test: Concurrent creation for the same plan
#[test]
fn test_second_environment_for_slug_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = WorkspaceManager::new(FakeVcs::new(dir.path()));

    let _env = manager.create("plan", None).unwrap();
    assert!(matches!(
        manager.create("plan", None),
        Err(Error::EnvironmentExists(slug)) if slug == "plan"
    ));
    assert!(manager.create("other", None).is_ok());
}

/// Test: Git-backed environment
/// Given a real repository
/// When an environment is created, written to and committed
/// Then the diff against its base shows the change, and a full teardown
/// removes both the worktree and the branch
#[test]
fn test_git_environment_round_trip() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path, repo.worktrees_dir()).unwrap());
    let manager = Arc::new(WorkspaceManager::new(vcs.clone()));

    let env = manager.create("add-auth", None).unwrap();
    assert_eq!(env.branch, "baton/add-auth");
    assert!(env.root.join("README.md").exists());
    assert!(repo.branch_exists("baton/add-auth"));

    std::fs::write(env.root.join("auth.rs"), "pub fn login() {}\n").unwrap();
    assert!(vcs.commit_all(&env.root, "add auth"));

    let changed = vcs.changed_files(&env.root, &env.base_commit).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "auth.rs");
    assert_eq!(changed[0].kind, ChangeKind::Added);

    manager.destroy(&env, Teardown::Full).unwrap();
    assert!(!env.root.exists());
    assert!(!repo.branch_exists("baton/add-auth"));
}

/// Test: Aborted branch is re-attached
/// Given an environment torn down with its branch kept
/// When the same plan gets a new environment
/// Then the branch still carries the earlier commit
#[test]
fn test_kept_branch_is_reused() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path, repo.worktrees_dir()).unwrap());
    let manager = Arc::new(WorkspaceManager::new(vcs.clone()));

    let env = manager.create("resume-me", None).unwrap();
    std::fs::write(env.root.join("partial.txt"), "half done\n").unwrap();
    assert!(vcs.commit_all(&env.root, "safety commit"));
    EnvironmentGuard::new(manager.clone(), env.clone()).release(Teardown::KeepBranch).unwrap();
    assert!(repo.branch_exists("baton/resume-me"));

    let again = manager.create("resume-me", None).unwrap();
    assert!(again.root.join("partial.txt").exists());
    manager.destroy(&again, Teardown::Full).unwrap();
}

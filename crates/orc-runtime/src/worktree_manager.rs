//! Worktree Manager (C3, spec §4.3).
//!
//! Generalizes the teacher's `tracker::git::GitTracker` (single-repo
//! commit-snapshot + diff against HEAD) into per-task isolated checkouts
//! using `git2`'s worktree API, plus the stale-registration-recovery and
//! protected-branch-guard policies spec §4.3 adds on top.

use std::path::{Path, PathBuf};

use git2::{Repository, WorktreeAddOptions};
use orc_common::error::{Classify, ErrorKind};
use thiserror::Error;
use uuid::Uuid;

const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop", "release"];

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worktree path {0} already exists as a real directory")]
    PathOccupied(PathBuf),

    #[error("push to protected branch {0} is refused")]
    ProtectedBranch(String),
}

impl Classify for WorktreeError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorktreeError::Git(_) | WorktreeError::Io(_) => ErrorKind::External,
            WorktreeError::PathOccupied(_) => ErrorKind::Precondition,
            WorktreeError::ProtectedBranch(_) => ErrorKind::Precondition,
        }
    }
}

pub struct CreatedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Owns the filesystem paths of every worktree it creates. No other
/// component may touch those paths directly (spec §5 shared-resource
/// policy).
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
    protected_branch: String,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, protected_branch: impl Into<String>) -> Self {
        let repo_root = repo_root.into();
        let worktrees_dir = repo_root.join(".orc").join("worktrees");
        WorktreeManager {
            repo_root,
            worktrees_dir,
            protected_branch: protected_branch.into(),
        }
    }

    fn worktree_name(task_id: Uuid, initiative_prefix: Option<&str>) -> String {
        match initiative_prefix {
            Some(prefix) => format!("{prefix}-{task_id}"),
            None => task_id.to_string(),
        }
    }

    /// `Create(taskID, sourceBranch) -> path, branch` (spec §4.3).
    ///
    /// Stale-registration recovery: if `git2` reports the worktree path is
    /// already registered but the directory is gone, prune the stale
    /// registration and retry once. If the directory genuinely exists,
    /// abort rather than clobber possible in-progress work.
    pub fn create(
        &self,
        task_id: Uuid,
        initiative_prefix: Option<&str>,
        source_branch: &str,
    ) -> Result<CreatedWorktree, WorktreeError> {
        let repo = Repository::open(&self.repo_root)?;
        let name = Self::worktree_name(task_id, initiative_prefix);
        let path = self.worktrees_dir.join(&name);
        let branch_name = format!("orc/{name}");

        if path.exists() {
            return Err(WorktreeError::PathOccupied(path));
        }

        match self.try_add_worktree(&repo, &name, &path, &branch_name, source_branch) {
            Ok(()) => {}
            Err(WorktreeError::Git(e)) if Self::looks_like_stale_registration(&e) => {
                self.prune_stale(&repo, &name)?;
                if path.exists() {
                    return Err(WorktreeError::PathOccupied(path));
                }
                self.try_add_worktree(&repo, &name, &path, &branch_name, source_branch)?;
            }
            Err(e) => return Err(e),
        }

        self.install_protected_branch_guard(&path)?;

        Ok(CreatedWorktree { path, branch: branch_name })
    }

    fn try_add_worktree(
        &self,
        repo: &Repository,
        name: &str,
        path: &Path,
        branch_name: &str,
        source_branch: &str,
    ) -> Result<(), WorktreeError> {
        let source = repo.find_branch(source_branch, git2::BranchType::Local)?;
        let source_commit = source.get().peel_to_commit()?;
        let branch = repo.branch(branch_name, &source_commit, false)?;
        let reference = branch.into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, path, Some(&opts))?;
        Ok(())
    }

    fn looks_like_stale_registration(err: &git2::Error) -> bool {
        err.message().contains("already exists") || err.message().contains("is not empty")
    }

    fn prune_stale(&self, repo: &Repository, name: &str) -> Result<(), WorktreeError> {
        if let Ok(wt) = repo.find_worktree(name) {
            let mut opts = git2::WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            wt.prune(Some(&mut opts))?;
        }
        Ok(())
    }

    /// Installs a pre-operation hook refusing commits/pushes to
    /// `protected_branch` or any of `{main, master, develop, release}`
    /// (spec §4.3). Implemented as a `pre-commit`/`pre-push` hook script in
    /// the worktree's git dir, in the teacher's shell-out style.
    fn install_protected_branch_guard(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let repo = Repository::open(worktree_path)?;
        let git_dir = repo.path().to_path_buf();
        let hooks_dir = git_dir.join("hooks");
        std::fs::create_dir_all(&hooks_dir)?;

        let mut guarded: Vec<&str> = PROTECTED_BRANCHES.to_vec();
        guarded.push(self.protected_branch.as_str());
        let guarded_pattern = guarded.join("|");

        let script = format!(
            "#!/bin/sh\nbranch=$(git rev-parse --abbrev-ref HEAD)\ncase \"$branch\" in\n  {guarded_pattern}) echo \"orc: refusing operation on protected branch $branch\" >&2; exit 1 ;;\nesac\nexit 0\n"
        );

        for hook_name in ["pre-commit", "pre-push"] {
            let hook_path = hooks_dir.join(hook_name);
            std::fs::write(&hook_path, &script)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(&hook_path)?.permissions();
                perms.set_mode(0o755);
                std::fs::set_permissions(&hook_path, perms)?;
            }
        }
        Ok(())
    }

    /// `Cleanup(path)`. Idempotent: a path with no git worktree
    /// registration is still removed if it exists on disk (spec §4.3
    /// failure semantics).
    pub fn cleanup(&self, path: &Path) -> Result<(), WorktreeError> {
        if let Ok(repo) = Repository::open(&self.repo_root)
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
            && let Ok(wt) = repo.find_worktree(name)
        {
            let mut opts = git2::WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            wt.prune(Some(&mut opts))?;
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// `ResetClaudeDir(path, sourceBranch)` delegates to the Phase Config
    /// Applier (C4), which owns the `.claude/` lifecycle; the Worktree
    /// Manager only exposes the worktree path for it to operate on.
    pub fn worktree_path(&self, task_id: Uuid, initiative_prefix: Option<&str>) -> PathBuf {
        self.worktrees_dir.join(Self::worktree_name(task_id, initiative_prefix))
    }

    pub fn target_branch(&self) -> &str {
        &self.protected_branch
    }

    /// `HasRemote(path) -> bool`. Sync operations must be skipped silently
    /// when the repo has no `origin` (spec §4.3).
    pub fn has_remote(&self, path: &Path) -> bool {
        Repository::open(path)
            .and_then(|repo| repo.find_remote("origin"))
            .is_ok()
    }

    /// Creates a checkpoint commit at a phase boundary (spec §4.7 step 6),
    /// generalized from the teacher's `GitTracker::snapshot_before`
    /// (stage-everything + commit, with an unborn-HEAD fallback) into the
    /// standard message format `[orc] checkpoint: <phase> (<task_id>)`.
    /// Returns `Ok(None)` when the worktree has nothing to commit.
    pub fn checkpoint_commit(
        &self,
        worktree_path: &Path,
        task_id: Uuid,
        phase_id: &str,
    ) -> Result<Option<String>, WorktreeError> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());
        let tree_id = index.write_tree()?;
        if head_tree.as_ref().map(|t| t.id()) == Some(tree_id) {
            return Ok(None); // nothing changed since the last checkpoint
        }
        let tree = repo.find_tree(tree_id)?;

        let sig = git2::Signature::now("orc", "orc@localhost")?;
        let message = format!("[orc] checkpoint: {phase_id} ({task_id})");

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let commit_id = match &parent {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?,
        };
        Ok(Some(commit_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo_with_commit(dir: &Path, branch: &str) {
        let run = |args: &[&str]| {
            let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", branch]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    #[test]
    fn has_remote_is_false_without_origin() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path(), "main");
        let mgr = WorktreeManager::new(dir.path(), "main");
        assert!(!mgr.has_remote(dir.path()));
    }

    #[test]
    fn create_produces_isolated_worktree_with_guard_hooks() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path(), "main");
        let mgr = WorktreeManager::new(dir.path(), "main");
        let task_id = Uuid::new_v4();

        let created = mgr.create(task_id, None, "main").unwrap();
        assert!(created.path.exists());
        assert!(created.path.join(".git").exists());

        let hooks_dir = Repository::open(&created.path).unwrap().path().join("hooks");
        assert!(hooks_dir.join("pre-commit").exists());
        assert!(hooks_dir.join("pre-push").exists());
    }

    #[test]
    fn creating_into_an_occupied_real_directory_aborts() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path(), "main");
        let mgr = WorktreeManager::new(dir.path(), "main");
        let task_id = Uuid::new_v4();
        let path = mgr.worktree_path(task_id, None);
        std::fs::create_dir_all(&path).unwrap();

        let result = mgr.create(task_id, None, "main");
        assert!(matches!(result, Err(WorktreeError::PathOccupied(_))));
    }

    #[test]
    fn checkpoint_commit_captures_new_changes_and_is_idempotent_on_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path(), "main");
        let mgr = WorktreeManager::new(dir.path(), "main");
        let task_id = Uuid::new_v4();

        std::fs::write(dir.path().join("NEW.md"), "phase output").unwrap();
        let sha = mgr.checkpoint_commit(dir.path(), task_id, "spec").unwrap();
        assert!(sha.is_some());

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert!(head.message().unwrap().contains("checkpoint: spec"));

        // No further changes: second checkpoint is a no-op.
        let second = mgr.checkpoint_commit(dir.path(), task_id, "implement").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn cleanup_is_idempotent_on_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path(), "main");
        let mgr = WorktreeManager::new(dir.path(), "main");
        let missing = dir.path().join("never-existed");
        assert!(mgr.cleanup(&missing).is_ok());
    }
}

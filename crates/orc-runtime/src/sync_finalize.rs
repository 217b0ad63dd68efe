//! Sync & Finalize (C9, spec §4.9).
//!
//! Two operations layered on the Worktree Manager's git plumbing: a
//! pre-phase sync that rebases the task branch onto the target branch
//! before phase 1 runs, and an async post-phase finalize pipeline that
//! syncs again, runs tests, risk-assesses the diff, and records a
//! [`FinalizeResult`]. Also owns the PR-merge retry protocol (spec §4.9
//! testable property 9: at most 3 attempts under HTTP 405).
//!
//! Grounded on the teacher's `tracker::git::GitTracker` diff/snapshot
//! machinery, generalized from single-repo HEAD diffing to a two-branch
//! rebase-and-report flow; the hosting-provider PR call itself is an
//! external collaborator (spec §1) reached through the [`PrClient`] trait
//! so this crate never depends on a concrete GitHub/GitLab SDK.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::Repository;
use orc_common::error::{Classify, ErrorKind};
use orc_common::phase::{Artifact, ArtifactType};
use orc_common::task::{SyncConflict, Task, TaskState, TaskStatus};
use orc_common::{Event, EventType};
use orc_store::Store;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::bus::EventBus;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("rebase produced conflicts in: {0:?}")]
    Conflict(Vec<String>),
    #[error("merge failed and is not retryable: {0}")]
    MergeFailed(String),
    #[error("test suite errored: {0}")]
    TestSuite(#[from] std::io::Error),
}

impl Classify for SyncError {
    fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Git(_) => ErrorKind::External,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::MergeFailed(_) => ErrorKind::External,
            SyncError::TestSuite(_) => ErrorKind::External,
        }
    }
}

/// Conflict data surfaced to the user (spec §3 `SyncConflict`, S6).
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    pub conflicted_files: Vec<String>,
    pub remediation: Vec<String>,
}

/// Rebases the worktree's current branch onto `target_branch`. On success,
/// returns `Ok(None)`; on conflict returns `Ok(Some(report))` so the caller
/// can decide whether to block (the `fail_on_conflict` default) or proceed
/// depending on config (spec §4.9).
pub fn sync_onto_target(worktree_path: &Path, target_branch: &str) -> Result<Option<ConflictReport>, SyncError> {
    let repo = Repository::open(worktree_path)?;
    let target_ref = repo.find_branch(target_branch, git2::BranchType::Local)?;
    let target_commit = repo.reference_to_annotated_commit(target_ref.get())?;

    let mut rebase = repo.rebase(None, Some(&target_commit), None, None)?;
    let mut conflicted_files = Vec::new();

    while let Some(op) = rebase.next() {
        op?;
        let index = repo.index()?;
        if index.has_conflicts() {
            let conflicts = index.conflicts()?;
            for conflict in conflicts.flatten() {
                if let Some(our) = conflict.our {
                    conflicted_files.push(String::from_utf8_lossy(&our.path).to_string());
                }
            }
        }
    }

    if !conflicted_files.is_empty() {
        rebase.abort()?;
        return Ok(Some(ConflictReport {
            remediation: vec![
                format!("git fetch origin {target_branch}"),
                format!("git rebase origin/{target_branch}"),
                "resolve conflicts, then `git rebase --continue`".to_string(),
            ],
            conflicted_files,
        }));
    }

    let sig = repo.signature()?;
    rebase.finish(Some(&sig))?;
    Ok(None)
}

/// Finalize progress, mirroring spec §4.9's {pending, running, completed,
/// failed} with the associated step label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeProgress {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Finalize result persisted and broadcast on completion (SPEC_FULL §0,
/// spec §4.9).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FinalizeResult {
    pub synced: bool,
    pub conflicts_resolved: bool,
    pub conflict_files: Vec<String>,
    pub tests_passed: bool,
    pub risk_level: RiskLevel,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub needs_review: bool,
    pub commit_sha: Option<String>,
    pub target_branch: String,
}

/// Risk heuristic: the teacher has no direct analogue, so this expansion
/// defines a conservative, size-based default — more files or lines
/// changed raises risk, and any unresolved conflict caps it at `High`.
/// `needs_review` is `true` whenever risk is not `Low`.
pub fn assess_risk(files_changed: u32, lines_changed: u32, had_conflicts: bool) -> (RiskLevel, bool) {
    let level = if had_conflicts || files_changed > 20 || lines_changed > 1000 {
        RiskLevel::High
    } else if files_changed > 5 || lines_changed > 200 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    (level, level != RiskLevel::Low)
}

/// Synthetic phase ID the finalize report artifact is keyed under — there
/// is no workflow phase named `finalize`, but `Artifact` requires one.
pub const FINALIZE_PHASE_ID: &str = "finalize";

/// Runs the configured test command (spec §4.9 step "run test suite") in
/// the worktree. `None` means no test command is configured, which passes
/// trivially rather than blocking every finalize on an ambient default.
pub async fn run_test_suite(worktree_path: &Path, command: Option<&[String]>) -> Result<bool, SyncError> {
    let Some((program, args)) = command.and_then(|c| c.split_first()) else {
        return Ok(true);
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .current_dir(worktree_path)
        .status()
        .await?;
    Ok(status.success())
}

fn diff_stats(worktree_path: &Path) -> Result<(u32, u32, Option<String>), SyncError> {
    let repo = Repository::open(worktree_path)?;
    let diff = repo.diff_tree_to_workdir_with_index(None, None)?;
    let stats = diff.stats()?;
    let commit_sha = repo.head().ok().and_then(|h| h.peel_to_commit().ok()).map(|c| c.id().to_string());
    Ok((stats.files_changed() as u32, (stats.insertions() + stats.deletions()) as u32, commit_sha))
}

fn emit_finalize_progress(bus: &EventBus, task_id: Uuid, progress: FinalizeProgress, step: &str, extra: serde_json::Value) {
    let mut data = serde_json::json!({"progress": progress, "step": step});
    if let (serde_json::Value::Object(ref mut map), serde_json::Value::Object(extra_map)) = (&mut data, extra) {
        map.extend(extra_map);
    }
    bus.publish(Event::new(Some(task_id), EventType::Finalize, data, "sync_finalize"));
}

fn finalize_failed(store: &Store, bus: &EventBus, task: Task, state: TaskState, reason: String) {
    let task_id = task.id;
    if let Err(e) = store.fail_task(task, state, reason.clone()) {
        warn!(error = %e, %task_id, "failed to mark task failed after finalize error");
    }
    emit_finalize_progress(bus, task_id, FinalizeProgress::Failed, "error", serde_json::json!({"reason": reason}));
}

/// The tracked async finalize pipeline (spec §4.9, C9): re-sync with the
/// target, run tests, risk-assess the diff, persist a [`FinalizeResult`]
/// as a `finalize_report` artifact, and mark the task completed. Every
/// step boundary emits a `finalize` event carrying [`FinalizeProgress`] and
/// a step label, mirroring the teacher's `factory::ws` pattern of
/// broadcasting state transitions as they happen rather than only at the
/// end. A sync conflict here (spec §4.9 S6) leaves the task `running` with
/// `TaskState.sync_conflict` set rather than failing it outright — the
/// task is not dead, just waiting on an external rebase.
pub async fn run_finalize(
    store: Arc<Store>,
    bus: EventBus,
    mut task: Task,
    mut state: TaskState,
    worktree_path: PathBuf,
    target_branch: String,
    test_command: Option<Vec<String>>,
) {
    let task_id = task.id;
    emit_finalize_progress(&bus, task_id, FinalizeProgress::Running, "sync", serde_json::json!({}));

    let conflict = match sync_onto_target(&worktree_path, &target_branch) {
        Ok(conflict) => conflict,
        Err(e) => {
            finalize_failed(&store, &bus, task, state, format!("sync failed: {e}"));
            return;
        }
    };

    if let Some(report) = conflict {
        state.sync_conflict = Some(SyncConflict {
            step: "sync_conflict".to_string(),
            conflicted_files: report.conflicted_files.clone(),
            remediation: report.remediation.clone(),
        });
        task.status = TaskStatus::Running;
        if let Err(e) = store.update_task(&task) {
            warn!(error = %e, %task_id, "failed to record sync conflict status");
        }
        if let Err(e) = store.put_task_state(task_id, &state) {
            warn!(error = %e, %task_id, "failed to persist sync conflict state");
        }
        emit_finalize_progress(
            &bus,
            task_id,
            FinalizeProgress::Failed,
            "sync_conflict",
            serde_json::json!({"conflicted_files": report.conflicted_files, "remediation": report.remediation}),
        );
        return;
    }

    emit_finalize_progress(&bus, task_id, FinalizeProgress::Running, "test", serde_json::json!({}));
    let tests_passed = match run_test_suite(&worktree_path, test_command.as_deref()).await {
        Ok(passed) => passed,
        Err(e) => {
            finalize_failed(&store, &bus, task, state, format!("test suite errored: {e}"));
            return;
        }
    };

    emit_finalize_progress(&bus, task_id, FinalizeProgress::Running, "risk_assess", serde_json::json!({}));
    let (files_changed, lines_changed, commit_sha) = match diff_stats(&worktree_path) {
        Ok(stats) => stats,
        Err(e) => {
            finalize_failed(&store, &bus, task, state, format!("diff stats failed: {e}"));
            return;
        }
    };
    let (risk_level, needs_review) = assess_risk(files_changed, lines_changed, false);

    let result = FinalizeResult {
        synced: true,
        conflicts_resolved: false,
        conflict_files: Vec::new(),
        tests_passed,
        risk_level,
        files_changed,
        lines_changed,
        needs_review,
        commit_sha,
        target_branch: target_branch.clone(),
    };

    let artifact = Artifact {
        task_id,
        phase_id: FINALIZE_PHASE_ID.to_string(),
        artifact_type: ArtifactType::FinalizeReport,
        content: serde_json::to_string(&result).unwrap_or_default(),
        created_at: chrono::Utc::now(),
    };
    if let Err(e) = store.put_artifact(&artifact) {
        warn!(error = %e, %task_id, "failed to persist finalize report artifact");
    }

    if let Err(e) = store.complete_task(task, state) {
        warn!(error = %e, %task_id, "failed to mark task completed after finalize");
        return;
    }

    emit_finalize_progress(
        &bus,
        task_id,
        FinalizeProgress::Completed,
        "done",
        serde_json::to_value(&result).unwrap_or_default(),
    );
}

/// Fire-and-forget dispatch of [`run_finalize`] (spec §4.9: "invoke Sync &
/// Finalize asynchronously"). The caller transitions the task to
/// `finalizing` and returns immediately; this task carries it to
/// `completed` or back to `running`/`failed`.
pub fn spawn_finalize(
    store: Arc<Store>,
    bus: EventBus,
    task: Task,
    state: TaskState,
    worktree_path: PathBuf,
    target_branch: String,
    test_command: Option<Vec<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_finalize(store, bus, task, state, worktree_path, target_branch, test_command))
}

/// Hosting-provider PR operations, reached only at this interface (spec
/// §1: out of scope as a collaborator). `orc-api` or a CLI driver supplies
/// a concrete GitHub/GitLab implementation; this crate only needs the
/// retry protocol around it.
#[async_trait::async_trait]
pub trait PrClient: Send + Sync {
    /// Attempts to merge a PR. Returns `Ok(sha)` on success. On a
    /// retryable conflict (`HTTP 405 Base branch was modified`), returns
    /// `Err(MergeOutcome::RetryableConflict)`; any other failure is
    /// `Err(MergeOutcome::Fatal(reason))`.
    async fn merge(&self, pr_id: &str) -> Result<String, MergeOutcome>;
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    RetryableConflict,
    Fatal(String),
}

const MAX_MERGE_ATTEMPTS: u32 = 3;
const MERGE_BACKOFFS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

/// PR merge retry protocol (spec §4.9, testable property 9): on a
/// retryable 405 conflict, back off (2s, 4s), rebase onto latest target
/// (caller's responsibility via `on_retry`), and retry — up to
/// [`MAX_MERGE_ATTEMPTS`] total attempts, never a 4th.
pub async fn merge_with_retry(
    client: &dyn PrClient,
    pr_id: &str,
    mut on_retry: impl FnMut() -> Result<(), SyncError>,
) -> Result<(String, u32), SyncError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.merge(pr_id).await {
            Ok(sha) => return Ok((sha, attempt)),
            Err(MergeOutcome::Fatal(reason)) => return Err(SyncError::MergeFailed(reason)),
            Err(MergeOutcome::RetryableConflict) => {
                if attempt >= MAX_MERGE_ATTEMPTS {
                    return Err(SyncError::MergeFailed(format!(
                        "exceeded {MAX_MERGE_ATTEMPTS} merge attempts"
                    )));
                }
                tokio::time::sleep(MERGE_BACKOFFS[(attempt - 1) as usize]).await;
                on_retry()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_two_diverging_branches(dir: &Path) {
        run(dir, &["init", "-b", "main"]);
        run(dir, &["config", "user.email", "t@t.com"]);
        run(dir, &["config", "user.name", "t"]);
        std::fs::write(dir.join("README.md"), "base\n").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-m", "base"]);
        run(dir, &["checkout", "-b", "task-branch"]);
        std::fs::write(dir.join("task.txt"), "task work\n").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-m", "task work"]);
        run(dir, &["checkout", "main"]);
        std::fs::write(dir.join("main.txt"), "unrelated main work\n").unwrap();
        run(dir, &["add", "."]);
        run(dir, &["commit", "-m", "main work"]);
        run(dir, &["checkout", "task-branch"]);
    }

    #[test]
    fn clean_rebase_onto_target_has_no_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        init_two_diverging_branches(dir.path());
        let result = sync_onto_target(dir.path(), "main").unwrap();
        assert!(result.is_none());
        assert!(dir.path().join("main.txt").exists());
        assert!(dir.path().join("task.txt").exists());
    }

    #[test]
    fn conflicting_rebase_reports_files_and_remediation() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "t@t.com"]);
        run(dir.path(), &["config", "user.name", "t"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "base"]);
        run(dir.path(), &["checkout", "-b", "task-branch"]);
        std::fs::write(dir.path().join("shared.txt"), "task version\n").unwrap();
        run(dir.path(), &["commit", "-am", "task edit"]);
        run(dir.path(), &["checkout", "main"]);
        std::fs::write(dir.path().join("shared.txt"), "main version\n").unwrap();
        run(dir.path(), &["commit", "-am", "main edit"]);
        run(dir.path(), &["checkout", "task-branch"]);

        let result = sync_onto_target(dir.path(), "main").unwrap();
        let report = result.expect("expected a conflict report");
        assert!(report.conflicted_files.iter().any(|f| f == "shared.txt"));
        assert!(!report.remediation.is_empty());
    }

    #[test]
    fn risk_assessment_flags_large_diffs_as_high_and_needing_review() {
        let (level, needs_review) = assess_risk(30, 1500, false);
        assert_eq!(level, RiskLevel::High);
        assert!(needs_review);

        let (level, needs_review) = assess_risk(1, 10, false);
        assert_eq!(level, RiskLevel::Low);
        assert!(!needs_review);
    }

    #[test]
    fn risk_assessment_caps_at_high_on_conflict_regardless_of_size() {
        let (level, _) = assess_risk(1, 5, true);
        assert_eq!(level, RiskLevel::High);
    }

    struct FlakyClient {
        fails_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl PrClient for FlakyClient {
        async fn merge(&self, _pr_id: &str) -> Result<String, MergeOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fails_before_success {
                Err(MergeOutcome::RetryableConflict)
            } else {
                Ok("deadbeef".to_string())
            }
        }
    }

    #[tokio::test]
    async fn merge_retries_twice_then_succeeds_on_third_attempt() {
        let client = FlakyClient { fails_before_success: 2, calls: AtomicU32::new(0) };
        let (sha, attempts) = merge_with_retry(&client, "pr-1", || Ok(())).await.unwrap();
        assert_eq!(sha, "deadbeef");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn merge_never_attempts_a_fourth_time() {
        let client = FlakyClient { fails_before_success: 10, calls: AtomicU32::new(0) };
        let err = merge_with_retry(&client, "pr-1", || Ok(())).await.unwrap_err();
        assert!(matches!(err, SyncError::MergeFailed(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), MAX_MERGE_ATTEMPTS);
    }

    #[tokio::test]
    async fn merge_fatal_error_does_not_retry() {
        struct AlwaysFatal;
        #[async_trait::async_trait]
        impl PrClient for AlwaysFatal {
            async fn merge(&self, _pr_id: &str) -> Result<String, MergeOutcome> {
                Err(MergeOutcome::Fatal("422 unprocessable".into()))
            }
        }
        let err = merge_with_retry(&AlwaysFatal, "pr-1", || Ok(())).await.unwrap_err();
        assert!(matches!(err, SyncError::MergeFailed(reason) if reason.contains("422")));
    }

    #[tokio::test]
    async fn no_test_command_passes_trivially() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_test_suite(dir.path(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_command_failure_is_reported_as_not_passed() {
        let dir = tempfile::tempdir().unwrap();
        let command = vec!["false".to_string()];
        assert!(!run_test_suite(dir.path(), Some(&command)).await.unwrap());
    }

    #[tokio::test]
    async fn run_finalize_completes_a_clean_rebase_and_marks_the_task_done() {
        let dir = tempfile::tempdir().unwrap();
        init_two_diverging_branches(dir.path());

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let task = store
            .create_task(&Task::new("t", "d", orc_common::task::Weight::Small))
            .unwrap();
        let mut events = bus.subscribe_task(task.id);
        let state = TaskState::default();

        run_finalize(
            store.clone(),
            bus,
            task.clone(),
            state,
            dir.path().to_path_buf(),
            "main".to_string(),
            None,
        )
        .await;

        let reloaded = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Completed);

        let artifact = store
            .get_artifact(task.id, FINALIZE_PHASE_ID, &ArtifactType::FinalizeReport)
            .unwrap()
            .expect("finalize report should be persisted");
        let result: FinalizeResult = serde_json::from_str(&artifact.content).unwrap();
        assert!(result.tests_passed);
        assert_eq!(result.risk_level, RiskLevel::Low);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == EventType::Finalize
                && event.data.get("progress").and_then(|v| v.as_str()) == Some("completed")
            {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn run_finalize_leaves_task_running_on_sync_conflict() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "t@t.com"]);
        run(dir.path(), &["config", "user.name", "t"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "base"]);
        run(dir.path(), &["checkout", "-b", "task-branch"]);
        std::fs::write(dir.path().join("shared.txt"), "task version\n").unwrap();
        run(dir.path(), &["commit", "-am", "task edit"]);
        run(dir.path(), &["checkout", "main"]);
        std::fs::write(dir.path().join("shared.txt"), "main version\n").unwrap();
        run(dir.path(), &["commit", "-am", "main edit"]);
        run(dir.path(), &["checkout", "task-branch"]);

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let mut task = Task::new("t", "d", orc_common::task::Weight::Small);
        task.status = TaskStatus::Finalizing;
        let task = store.create_task(&task).unwrap();
        let state = TaskState::default();

        run_finalize(store.clone(), bus, task.clone(), state, dir.path().to_path_buf(), "main".to_string(), None).await;

        let reloaded = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Running);
        let state = store.get_task_state(task.id).unwrap();
        let conflict = state.sync_conflict.expect("sync conflict should be recorded");
        assert!(conflict.conflicted_files.iter().any(|f| f == "shared.txt"));
    }
}

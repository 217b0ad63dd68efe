//! Task Executor (C8, spec §4.8).
//!
//! Owns one task's lifecycle across its whole workflow: `created ->
//! planned -> running -> {paused, blocked, failed, finalizing} ->
//! completed`. Drives the Phase Runner phase-by-phase in topological
//! order, handles pause/resume/rewind, and writes a heartbeat so the
//! Supervisor's orphan sweep has something to check against. Generalizes
//! the teacher's `orchestrator::Orchestrator::run` top-level loop (spawn
//! worktree, iterate phases, handle failure) into the richer pause/rewind
//! state machine spec §4.8 draws.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use orc_common::phase::{Phase, Workflow};
use orc_common::task::{Task, TaskState, TaskStatus};
use orc_store::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::phase_runner::{PhaseError, PhaseOutcome, PhaseRunner};
use crate::turn_executor::{ActivitySink, NullSink};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Best-effort local hostname for `ExecutionInfo.host` (spec §4.8 "record
/// execution info (PID, host, started-at) on start").
#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    None
}

#[derive(Debug, thiserror::Error)]
pub enum TaskExecError {
    #[error("phase error: {0}")]
    Phase(#[from] PhaseError),
    #[error("store error: {0}")]
    Store(#[from] orc_store::StoreError),
    #[error("workflow error: {0}")]
    Workflow(#[from] orc_common::phase::WorkflowError),
    #[error("task {0} is paused and cannot advance")]
    Paused(uuid::Uuid),
}

impl orc_common::error::Classify for TaskExecError {
    fn kind(&self) -> orc_common::error::ErrorKind {
        use orc_common::error::ErrorKind;
        match self {
            TaskExecError::Phase(e) => e.kind(),
            TaskExecError::Store(e) => e.kind(),
            TaskExecError::Workflow(_) => ErrorKind::InvariantViolation,
            TaskExecError::Paused(_) => ErrorKind::Precondition,
        }
    }
}

/// Everything the Task Executor needs to run one phase, supplied by
/// whichever layer above it (Supervisor, or a test) resolves templates and
/// per-phase config. Kept as a trait so `orc-runtime` doesn't have to know
/// about skill-file loading or prompt-template storage.
pub trait PhaseMaterials: Send + Sync {
    fn prompt_template(&self, phase: &Phase) -> String;
    fn claude_config(&self, phase: &Phase) -> crate::config_applier::PhaseClaudeConfig;
    fn skill_files(&self, phase: &Phase) -> Vec<(String, String)>;
    fn source_committed_claude_dir(&self) -> Option<PathBuf>;
}

pub struct TaskExecutor {
    store: Arc<Store>,
    bus: EventBus,
    phase_runner: Arc<PhaseRunner>,
    cancel: CancellationToken,
    test_command: Option<Vec<String>>,
}

/// Cancels the heartbeat updater when a `run()` call returns by any path,
/// so a paused/blocked/failed/completed task never keeps writing a
/// heartbeat after its executor has let go of it.
struct HeartbeatGuard {
    cancel: CancellationToken,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TaskExecutor {
    pub fn new(store: Arc<Store>, bus: EventBus, phase_runner: Arc<PhaseRunner>) -> Self {
        TaskExecutor {
            store,
            bus,
            phase_runner,
            cancel: CancellationToken::new(),
            test_command: None,
        }
    }

    /// Configures the finalize pipeline's test-suite command (spec §4.9
    /// "run test suite"). Left unset, finalize passes the test step
    /// trivially rather than blocking every task on an ambient default.
    pub fn with_test_command(mut self, command: Vec<String>) -> Self {
        self.test_command = Some(command);
        self
    }

    /// Spawns the periodic heartbeat updater (spec §4.8: "write a
    /// heartbeat so the Supervisor's orphan sweep has something to check
    /// against"). Runs until `cancel` fires.
    fn spawn_heartbeat(&self, task_id: uuid::Uuid, cancel: CancellationToken) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it, start already stamped
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(Some(mut task)) = store.get_task(task_id) {
                            task.execution_info.heartbeat_at = Some(chrono::Utc::now());
                            if let Err(e) = store.update_task(&task) {
                                warn!(error = %e, %task_id, "failed to update heartbeat");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Cooperative pause: signals the token; the in-flight phase's next
    /// await point (a turn boundary, not mid-turn) observes it. Spec §4.8:
    /// "pause takes effect at the next phase/iteration boundary, never
    /// mid-turn".
    pub fn request_pause(&self) {
        self.cancel.cancel();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn phase_runner(&self) -> &Arc<PhaseRunner> {
        &self.phase_runner
    }

    /// Runs `task` through `workflow` starting at `task.current_phase` (or
    /// the workflow's first phase if unset), advancing one phase at a time
    /// until completion, a blocking gate, pause, or failure. The second
    /// element of the returned pair is the finalize pipeline's join handle
    /// — `Some` only when every phase completed and finalize was
    /// dispatched; callers that need the task fully settled before moving
    /// on (a one-shot CLI invocation) should await it, server-style
    /// callers may drop it and let it run in the background.
    pub async fn run(
        &self,
        mut task: Task,
        workflow: &Workflow,
        materials: &dyn PhaseMaterials,
        worktree_path: &std::path::Path,
    ) -> Result<(Task, Option<tokio::task::JoinHandle<()>>), TaskExecError> {
        let ordered = workflow.topological_order()?;
        let mut state = self.store.get_task_state(task.id)?;

        if task.status == TaskStatus::Created {
            task.status = TaskStatus::Planned;
            task = self.store.update_task(&task)?;
        }
        task.status = TaskStatus::Running;
        task.execution_info.pid = Some(std::process::id());
        task.execution_info.host = hostname();
        task.execution_info.heartbeat_at = Some(chrono::Utc::now());
        task = self.store.update_task(&task)?;

        let heartbeat_cancel = CancellationToken::new();
        self.spawn_heartbeat(task.id, heartbeat_cancel.clone());
        let _heartbeat_guard = HeartbeatGuard { cancel: heartbeat_cancel };

        let start_index = task
            .current_phase
            .as_ref()
            .and_then(|id| ordered.iter().position(|p| p == id))
            .unwrap_or(0);

        if start_index == 0 && state.phases.is_empty() {
            let target_branch = self.phase_runner.worktree_manager().target_branch().to_string();
            match crate::sync_finalize::sync_onto_target(worktree_path, &target_branch) {
                Ok(None) => {}
                Ok(Some(report)) => {
                    state.sync_conflict = Some(orc_common::task::SyncConflict {
                        step: "sync_on_start".to_string(),
                        conflicted_files: report.conflicted_files.clone(),
                        remediation: report.remediation,
                    });
                    let reason = format!("sync-on-start conflict in: {}", report.conflicted_files.join(", "));
                    let (blocked_task, _) = self.store.block_task(task, state, reason)?;
                    return Ok((blocked_task, None));
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "sync-on-start failed");
                    let (failed_task, _) = self.store.fail_task(task, state, format!("sync-on-start failed: {e}"))?;
                    return Ok((failed_task, None));
                }
            }
        }

        for phase_id in &ordered[start_index..] {
            if self.is_pause_requested() {
                task.status = TaskStatus::Paused;
                task.current_phase = Some(phase_id.clone());
                return Ok((self.store.update_task(&task)?, None));
            }

            if state.phases.get(phase_id).is_some_and(|p| p.completed_at.is_some()) {
                continue;
            }

            let phase = workflow
                .phase(phase_id)
                .expect("topological_order only yields ids present in the workflow");

            task.current_phase = Some(phase_id.clone());
            task = self.store.update_task(&task)?;

            let outcome = self
                .run_phase(&task, &mut state, phase, materials, worktree_path)
                .await;

            self.store.put_task_state(task.id, &state)?;

            match outcome {
                Ok(PhaseOutcome::Completed { .. }) => {
                    info!(task_id = %task.id, phase = %phase_id, "phase completed");
                    continue;
                }
                Ok(PhaseOutcome::Blocked { questions }) => {
                    let (blocked_task, _) = self.store.block_task(
                        task,
                        state,
                        format!("blocked pending clarification: {}", questions.join("; ")),
                    )?;
                    return Ok((blocked_task, None));
                }
                Err(e) => {
                    warn!(task_id = %task.id, phase = %phase_id, error = %e, "phase failed");
                    let (failed_task, _) = self.store.fail_task(task, state, e.to_string())?;
                    return Ok((failed_task, None));
                }
            }
        }

        task.status = TaskStatus::Finalizing;
        task = self.store.update_task(&task)?;

        let target_branch = self.phase_runner.worktree_manager().target_branch().to_string();
        let handle = crate::sync_finalize::spawn_finalize(
            self.store.clone(),
            self.bus.clone(),
            task.clone(),
            state,
            worktree_path.to_path_buf(),
            target_branch,
            self.test_command.clone(),
        );
        Ok((task, Some(handle)))
    }

    async fn run_phase(
        &self,
        task: &Task,
        state: &mut TaskState,
        phase: &Phase,
        materials: &dyn PhaseMaterials,
        worktree_path: &std::path::Path,
    ) -> Result<PhaseOutcome, TaskExecError> {
        let template = materials.prompt_template(phase);
        let claude_config = materials.claude_config(phase);
        let skill_files = materials.skill_files(phase);
        let source_dir = materials.source_committed_claude_dir();

        let sink: &dyn ActivitySink = &NullSink;
        let outcome = self
            .phase_runner
            .run(
                task,
                state,
                phase,
                worktree_path,
                &template,
                source_dir.as_deref(),
                &claude_config,
                &skill_files,
                &phase.auto_predicates,
                sink,
            )
            .await?;
        Ok(outcome)
    }

    /// `Rewind(taskID, toPhase)`: resets the named phase and every phase
    /// after it to not-yet-run, preserving completed/skipped sub-state for
    /// phases strictly before it even across a weight change that dropped
    /// or added phases (spec §4.8 rewind semantics — never discards earlier
    /// history).
    pub fn rewind(&self, task_id: uuid::Uuid, to_phase: &str, ordered: &[String]) -> Result<(), TaskExecError> {
        let mut state = self.store.get_task_state(task_id)?;
        let Some(pos) = ordered.iter().position(|id| id == to_phase) else {
            return Ok(());
        };
        for phase_id in &ordered[pos..] {
            state.phases.remove(phase_id);
        }
        let mut task = self
            .store
            .get_task(task_id)?
            .ok_or(orc_store::StoreError::NotFound)?;
        task.current_phase = Some(to_phase.to_string());
        task.status = TaskStatus::Planned;
        self.store.update_task(&task)?;
        self.store.put_task_state(task_id, &state)?;
        self.bus.emit_session_update(task_id, serde_json::json!({"rewound_to": to_phase}));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticMaterials;
    impl PhaseMaterials for StaticMaterials {
        fn prompt_template(&self, phase: &Phase) -> String {
            format!("run {}", phase.template_id)
        }
        fn claude_config(&self, _phase: &Phase) -> crate::config_applier::PhaseClaudeConfig {
            Default::default()
        }
        fn skill_files(&self, _phase: &Phase) -> Vec<(String, String)> {
            Vec::new()
        }
        fn source_committed_claude_dir(&self) -> Option<PathBuf> {
            None
        }
    }

    #[test]
    fn pause_request_is_observable() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let turn_executor = crate::turn_executor::TurnExecutor::new(
            "/bin/true",
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(crate::gate_evaluator::GateEvaluator::new(
            turn_executor.clone(),
            store.clone(),
            bus.clone(),
        ));
        let worktree_manager = Arc::new(crate::worktree_manager::WorktreeManager::new(
            std::env::temp_dir(),
            "main",
        ));
        let phase_runner = Arc::new(PhaseRunner::new(
            store.clone(),
            bus.clone(),
            turn_executor,
            gate_evaluator,
            worktree_manager,
        ));
        let executor = TaskExecutor::new(store, bus, phase_runner);
        assert!(!executor.is_pause_requested());
        executor.request_pause();
        assert!(executor.is_pause_requested());
    }

    #[test]
    fn rewind_removes_sub_state_from_named_phase_onward() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let task = Task::new("t", "d", orc_common::task::Weight::Small);
        let task = store.create_task(&task).unwrap();

        let mut state = TaskState::default();
        state.phase_mut("spec").completed_at = Some(chrono::Utc::now());
        state.phase_mut("implement").completed_at = Some(chrono::Utc::now());
        store.put_task_state(task.id, &state).unwrap();

        let turn_executor = crate::turn_executor::TurnExecutor::new(
            "/bin/true",
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(crate::gate_evaluator::GateEvaluator::new(
            turn_executor.clone(),
            store.clone(),
            bus.clone(),
        ));
        let worktree_manager = Arc::new(crate::worktree_manager::WorktreeManager::new(
            std::env::temp_dir(),
            "main",
        ));
        let phase_runner = Arc::new(PhaseRunner::new(
            store.clone(),
            bus.clone(),
            turn_executor,
            gate_evaluator,
            worktree_manager,
        ));
        let executor = TaskExecutor::new(store.clone(), bus, phase_runner);

        let ordered = vec!["spec".to_string(), "implement".to_string()];
        executor.rewind(task.id, "implement", &ordered).unwrap();

        let state = store.get_task_state(task.id).unwrap();
        assert!(state.phases.get("spec").unwrap().completed_at.is_some());
        assert!(state.phases.get("implement").is_none());
    }

    fn init_repo_with_commit(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git").args(args).current_dir(dir).status().unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    fn write_fake_cli(dir: &std::path::Path) -> std::path::PathBuf {
        let script = dir.join("fake-cli.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"type\":\"result\",\"result\":\"ok\",\"is_error\":false}'\nexit 0\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        script
    }

    #[tokio::test]
    async fn full_run_syncs_on_start_and_dispatches_finalize_that_completes_the_task() {
        let worktree = tempfile::tempdir().unwrap();
        init_repo_with_commit(worktree.path());
        let cli = write_fake_cli(worktree.path());

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let turn_executor = crate::turn_executor::TurnExecutor::new(
            cli,
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(crate::gate_evaluator::GateEvaluator::new(
            turn_executor.clone(),
            store.clone(),
            bus.clone(),
        ));
        let worktree_manager = Arc::new(crate::worktree_manager::WorktreeManager::new(worktree.path(), "main"));
        let phase_runner = Arc::new(PhaseRunner::new(
            store.clone(),
            bus.clone(),
            turn_executor,
            gate_evaluator,
            worktree_manager,
        ));
        let executor = TaskExecutor::new(store.clone(), bus, phase_runner);

        let task = Task::new("t", "d", orc_common::task::Weight::Small);
        let task = store.create_task(&task).unwrap();
        let workflow = Workflow::new("w", vec![Phase::new("implement", "implement", orc_common::gate::GateType::Auto)]);
        let materials = StaticMaterials;

        let (task, handle) = executor.run(task, &workflow, &materials, worktree.path()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finalizing);

        handle.expect("finalize should have been dispatched").await.unwrap();

        let completed = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
    }
}

//! Phase Runner (C7, spec §4.7).
//!
//! Drives one phase of one task to completion: load context, substitute
//! the prompt template, hand the worktree to the Phase Config Applier,
//! loop turns up to `max_iterations`, evaluate the exit gate, persist the
//! artifact on success. Generalizes the teacher's `phase::executor`
//! single-iteration-then-gate loop (see `phase/mod.rs`'s `run_phase`) into
//! the full iterate-until-gate-or-exhausted state machine spec §4.7 names.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orc_common::gate::{AutoPredicate, GateDecision, GateType};
use orc_common::phase::{Artifact, Phase};
use orc_common::task::{PhaseSubState, Task, TaskState};
use orc_store::Store;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config_applier::{ConfigApplierError, PhaseClaudeConfig, PhaseConfigApplier};
use crate::gate_evaluator::{GateError, GateEvaluator};
use crate::turn_executor::{ActivitySink, TurnError, TurnExecutor};
use crate::worktree_manager::{WorktreeError, WorktreeManager};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("turn error: {0}")]
    Turn(#[from] TurnError),
    #[error("gate error: {0}")]
    Gate(#[from] GateError),
    #[error("config applier error: {0}")]
    ConfigApplier(#[from] ConfigApplierError),
    #[error("store error: {0}")]
    Store(#[from] orc_store::StoreError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("phase {0} exhausted max_iterations ({1}) without gate approval")]
    IterationsExhausted(String, u32),
    #[error("phase {0} is blocked pending clarification")]
    Blocked(String),
    #[error("phase {0} rejected by human gate: {1}")]
    HumanRejected(String, String),
}

impl orc_common::error::Classify for PhaseError {
    fn kind(&self) -> orc_common::error::ErrorKind {
        use orc_common::error::ErrorKind;
        match self {
            PhaseError::Turn(e) => e.kind(),
            PhaseError::Gate(GateError::Turn(e)) => e.kind(),
            PhaseError::Gate(GateError::Dropped(_)) => ErrorKind::Cancelled,
            PhaseError::ConfigApplier(_) => ErrorKind::External,
            PhaseError::Store(e) => e.kind(),
            PhaseError::Worktree(_) => ErrorKind::External,
            PhaseError::IterationsExhausted(..) => ErrorKind::Precondition,
            PhaseError::Blocked(_) => ErrorKind::Precondition,
            PhaseError::HumanRejected(..) => ErrorKind::Precondition,
        }
    }
}

/// Outcome of driving a phase to its conclusion. The Task Executor decides
/// what to do with each variant (advance, block, fail).
pub enum PhaseOutcome {
    Completed { artifact: Option<Artifact> },
    Blocked { questions: Vec<String> },
}

/// Default upper bound on a single phase across all its iterations, taken
/// from the middle of the spec's documented 30m-1h range.
pub const DEFAULT_PHASE_MAX: Duration = Duration::from_secs(45 * 60);

pub struct PhaseRunner {
    store: Arc<Store>,
    bus: EventBus,
    turn_executor: TurnExecutor,
    gate_evaluator: Arc<GateEvaluator>,
    worktree_manager: Arc<WorktreeManager>,
    phase_max: Duration,
}

impl PhaseRunner {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        turn_executor: TurnExecutor,
        gate_evaluator: Arc<GateEvaluator>,
        worktree_manager: Arc<WorktreeManager>,
    ) -> Self {
        PhaseRunner {
            store,
            bus,
            turn_executor,
            gate_evaluator,
            worktree_manager,
            phase_max: DEFAULT_PHASE_MAX,
        }
    }

    /// Overrides the default total-phase timeout (spec §5 `timeouts.phase_max`).
    pub fn with_phase_max(mut self, phase_max: Duration) -> Self {
        self.phase_max = phase_max;
        self
    }

    /// Shared handle to the Gate Evaluator, for control-plane adapters that
    /// need to list/resolve pending human gates (spec §6).
    pub fn gate_evaluator(&self) -> &Arc<GateEvaluator> {
        &self.gate_evaluator
    }

    pub fn worktree_manager(&self) -> &Arc<WorktreeManager> {
        &self.worktree_manager
    }

    /// Substitutes `{{task.title}}`, `{{task.description}}`, and
    /// `{{phase.template_id}}` placeholders into a template string. Deferred
    /// template-language questions (spec §9 open question on `condition`)
    /// are out of scope here; this is plain string substitution only.
    fn render_prompt(template: &str, task: &Task, phase: &Phase) -> String {
        template
            .replace("{{task.title}}", &task.title)
            .replace("{{task.description}}", &task.description)
            .replace("{{phase.template_id}}", &phase.template_id)
    }

    /// Runs `phase` for `task` inside `worktree_path`, looping turns until
    /// the gate approves, the phase is blocked pending clarification, or
    /// `max_iterations` is exhausted (a hard error, per spec §4.7 — never a
    /// silent forced-pass).
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        task: &Task,
        state: &mut TaskState,
        phase: &Phase,
        worktree_path: &Path,
        prompt_template: &str,
        source_committed_claude_dir: Option<&Path>,
        phase_config: &PhaseClaudeConfig,
        skill_files: &[(String, String)],
        auto_predicates: &[AutoPredicate],
        sink: &dyn ActivitySink,
    ) -> Result<PhaseOutcome, PhaseError> {
        let applier = PhaseConfigApplier::new(worktree_path);
        applier.reset(source_committed_claude_dir)?;
        applier.apply(phase_config, skill_files)?;

        let sub_state = state.phase_mut(&phase.id);
        sub_state.started_at = Some(chrono::Utc::now());

        let prompt = Self::render_prompt(prompt_template, task, phase);
        let ultrathink = matches!(task.weight, orc_common::task::Weight::Large | orc_common::task::Weight::Greenfield);
        let phase_deadline = tokio::time::Instant::now() + self.phase_max;

        let result = self
            .run_iterations(
                task,
                state,
                phase,
                worktree_path,
                &prompt,
                ultrathink,
                phase_deadline,
                auto_predicates,
                sink,
            )
            .await;

        // The bracket's reset half (spec §4.4 step 5, §9): every exit path
        // — completed, blocked, rejected, exhausted, timed out, errored —
        // must leave the worktree's `.claude` dir back at the source
        // branch's committed contents. A failed reset doesn't shadow the
        // phase's own outcome; it's surfaced as a warning event instead.
        if let Err(reset_err) = applier.reset(source_committed_claude_dir) {
            warn!(phase_id = %phase.id, error = %reset_err, "phase config reset after termination failed");
            self.emit_phase_event(
                task.id,
                serde_json::json!({
                    "phase_id": phase.id,
                    "status": "reset_failed",
                    "error": reset_err.to_string(),
                }),
            );
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iterations(
        &self,
        task: &Task,
        state: &mut TaskState,
        phase: &Phase,
        worktree_path: &Path,
        prompt: &str,
        ultrathink: bool,
        phase_deadline: tokio::time::Instant,
        auto_predicates: &[AutoPredicate],
        sink: &dyn ActivitySink,
    ) -> Result<PhaseOutcome, PhaseError> {
        for iteration in 1..=phase.max_iterations {
            state.phase_mut(&phase.id).iteration = iteration;

            let outcome = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(phase_deadline) => {
                    return Err(PhaseError::Turn(TurnError::PhaseTimeout(self.phase_max)));
                }
                result = self.turn_executor.run_turn(
                    worktree_path,
                    prompt,
                    ultrathink,
                    phase.produces_artifact,
                    &Default::default(),
                    sink,
                ) => result?,
            };

            let decision = self
                .evaluate_gate(task, phase, worktree_path, &outcome.raw_output, outcome.is_error, auto_predicates, sink)
                .await?;

            match decision {
                GateDecision { approved: true, .. } => {
                    let artifact = self.persist_artifact_if_any(task.id, phase, &outcome)?;
                    let sub_state = state.phase_mut(&phase.id);
                    sub_state.completed_at = Some(chrono::Utc::now());
                    sub_state.gate_decision = Some(decision);

                    let checkpoint_sha = self
                        .worktree_manager
                        .checkpoint_commit(worktree_path, task.id, &phase.id)?;

                    self.emit_phase_event(
                        task.id,
                        serde_json::json!({
                            "phase_id": phase.id,
                            "status": "completed",
                            "checkpoint_sha": checkpoint_sha,
                        }),
                    );

                    return Ok(PhaseOutcome::Completed { artifact });
                }
                GateDecision { approved: false, ref questions, .. } if !questions.is_empty() => {
                    state.phase_mut(&phase.id).gate_decision = Some(decision.clone());
                    return Ok(PhaseOutcome::Blocked { questions: questions.clone() });
                }
                // A human gate's plain (non-clarifying) rejection fails the
                // phase outright rather than spending another iteration —
                // retrying without the human asking for anything different
                // would just re-run the same turn against the same verdict.
                GateDecision { approved: false, reason, .. } if phase.gate_type == GateType::Human => {
                    state.phase_mut(&phase.id).gate_decision = Some(GateDecision::reject(
                        orc_common::gate::GateSource::Human,
                        reason.clone(),
                    ));
                    state.phase_mut(&phase.id).error = Some(reason.clone());
                    return Err(PhaseError::HumanRejected(phase.id.clone(), reason));
                }
                GateDecision { approved: false, reason, .. } => {
                    state.phase_mut(&phase.id).error = Some(reason);
                    continue;
                }
            }
        }

        Err(PhaseError::IterationsExhausted(phase.id.clone(), phase.max_iterations))
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_gate(
        &self,
        task: &Task,
        phase: &Phase,
        worktree_path: &Path,
        raw_output: &str,
        is_error: bool,
        auto_predicates: &[AutoPredicate],
        sink: &dyn ActivitySink,
    ) -> Result<GateDecision, PhaseError> {
        let decision = match phase.gate_type {
            GateType::Auto => {
                self.gate_evaluator.evaluate_auto(auto_predicates, raw_output, is_error)
            }
            GateType::Skip => self.gate_evaluator.evaluate_skip(),
            GateType::Ai => {
                let judge_prompt = format!(
                    "Review the following phase output for task \"{}\" and decide approve/reject:\n\n{}",
                    task.title, raw_output
                );
                self.gate_evaluator.evaluate_ai(worktree_path, &judge_prompt, sink).await?
            }
            GateType::Human => {
                self.gate_evaluator
                    .evaluate_human(task.id, &phase.id, format!("Approve phase {}?", phase.id))
                    .await?
            }
        };
        Ok(decision)
    }

    fn persist_artifact_if_any(
        &self,
        task_id: Uuid,
        phase: &Phase,
        outcome: &crate::turn_executor::TurnOutcome,
    ) -> Result<Option<Artifact>, PhaseError> {
        let Some(artifact_type) = phase.artifact_type.clone() else { return Ok(None) };
        let content = outcome
            .structured
            .as_ref()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| outcome.raw_output.clone());

        let artifact = Artifact {
            task_id,
            phase_id: phase.id.clone(),
            artifact_type,
            content,
            created_at: chrono::Utc::now(),
        };
        self.store.put_artifact(&artifact)?;
        Ok(Some(artifact))
    }

    pub fn emit_phase_event(&self, task_id: Uuid, payload: serde_json::Value) {
        self.bus.publish(orc_common::Event::new(
            Some(task_id),
            orc_common::EventType::Phase,
            payload,
            "phase_runner",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_substitutes_known_placeholders() {
        let task = Task::new("Add retries", "backoff on 5xx", orc_common::task::Weight::Small);
        let phase = Phase::new("implement", "implement", GateType::Auto);
        let rendered = PhaseRunner::render_prompt(
            "Task: {{task.title}} ({{phase.template_id}}) - {{task.description}}",
            &task,
            &phase,
        );
        assert_eq!(rendered, "Task: Add retries (implement) - backoff on 5xx");
    }

    #[test]
    fn phase_sub_state_defaults_have_no_completion() {
        let sub = PhaseSubState::default();
        assert!(sub.completed_at.is_none());
        assert_eq!(sub.iteration, 0);
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

    /// Writes a stand-in CLI that emits one `result` stream-json frame and
    /// exits 0, mimicking the real coding-assistant CLI closely enough for
    /// the Turn Executor to parse successfully.
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
    async fn run_completes_phase_checkpoints_worktree_and_emits_event() {
        let worktree = tempfile::tempdir().unwrap();
        init_repo_with_commit(worktree.path());
        let cli = write_fake_cli(worktree.path());

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());

        let turn_executor = TurnExecutor::new(
            cli,
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(GateEvaluator::new(turn_executor.clone(), store.clone(), bus.clone()));
        let worktree_manager = Arc::new(WorktreeManager::new(worktree.path(), "main"));

        let task = Task::new("Add retries", "backoff on 5xx", orc_common::task::Weight::Small);
        let mut task_events = bus.subscribe_task(task.id);
        let runner = PhaseRunner::new(store, bus, turn_executor, gate_evaluator, worktree_manager);
        let mut state = TaskState::default();
        let phase = Phase::new("implement", "implement", GateType::Auto);
        let sink = crate::turn_executor::NullSink;

        let outcome = runner
            .run(
                &task,
                &mut state,
                &phase,
                worktree.path(),
                "do the thing",
                None,
                &PhaseClaudeConfig::default(),
                &[],
                &[AutoPredicate::HasOutput, AutoPredicate::NoErrors],
                &sink,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, PhaseOutcome::Completed { .. }));
        assert!(state.phases.get("implement").unwrap().completed_at.is_some());

        let repo = git2::Repository::open(worktree.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert!(head.message().unwrap().contains("checkpoint: implement"));

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), task_events.recv())
            .await
            .expect("phase event should be published")
            .unwrap();
        assert_eq!(event.event_type, orc_common::EventType::Phase);
    }

    #[tokio::test]
    async fn run_times_out_when_phase_max_is_exceeded() {
        let worktree = tempfile::tempdir().unwrap();
        init_repo_with_commit(worktree.path());

        let script = worktree.path().join("slow-cli.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nsleep 5\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let turn_executor = TurnExecutor::new(
            script,
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(GateEvaluator::new(turn_executor.clone(), store.clone(), bus.clone()));
        let worktree_manager = Arc::new(WorktreeManager::new(worktree.path(), "main"));
        let runner = PhaseRunner::new(store, bus, turn_executor, gate_evaluator, worktree_manager)
            .with_phase_max(Duration::from_millis(50));

        let task = Task::new("Add retries", "backoff on 5xx", orc_common::task::Weight::Small);
        let mut state = TaskState::default();
        let phase = Phase::new("implement", "implement", GateType::Auto);
        let sink = crate::turn_executor::NullSink;

        let result = runner
            .run(
                &task,
                &mut state,
                &phase,
                worktree.path(),
                "do the thing",
                None,
                &PhaseClaudeConfig::default(),
                &[],
                &[AutoPredicate::HasOutput, AutoPredicate::NoErrors],
                &sink,
            )
            .await;

        assert!(matches!(result, Err(PhaseError::Turn(TurnError::PhaseTimeout(_)))));
    }

    #[tokio::test]
    async fn human_gate_plain_rejection_fails_the_phase_without_retrying() {
        let worktree = tempfile::tempdir().unwrap();
        init_repo_with_commit(worktree.path());
        let cli = write_fake_cli(worktree.path());

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let turn_executor = TurnExecutor::new(
            cli,
            "test-model",
            crate::turn_executor::TurnTimeouts::default(),
        );
        let gate_evaluator = Arc::new(GateEvaluator::new(turn_executor.clone(), store.clone(), bus.clone()));
        let worktree_manager = Arc::new(WorktreeManager::new(worktree.path(), "main"));
        let runner = Arc::new(PhaseRunner::new(store, bus, turn_executor, gate_evaluator, worktree_manager));

        let task = Task::new("Add retries", "backoff on 5xx", orc_common::task::Weight::Small);
        let phase = Phase::new("review", "review", GateType::Human);

        // Resolve the parked human gate with a plain reject (no
        // clarification questions) as soon as it appears.
        let resolver = {
            let runner = runner.clone();
            let task_id = task.id;
            let phase_id = phase.id.clone();
            tokio::spawn(async move {
                let decision_id = orc_common::gate::PendingDecision::make_id(task_id, &phase_id);
                loop {
                    if runner
                        .gate_evaluator()
                        .list_pending()
                        .iter()
                        .any(|p| p.decision_id == decision_id)
                    {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                runner.gate_evaluator().resolve(
                    &decision_id,
                    GateDecision::reject(orc_common::gate::GateSource::Human, "not good enough"),
                )
            })
        };

        let mut state = TaskState::default();
        let sink = crate::turn_executor::NullSink;
        let result = runner
            .run(
                &task,
                &mut state,
                &phase,
                worktree.path(),
                "do the thing",
                None,
                &PhaseClaudeConfig::default(),
                &[],
                &[AutoPredicate::HasOutput, AutoPredicate::NoErrors],
                &sink,
            )
            .await;

        assert!(resolver.await.unwrap());
        assert!(matches!(result, Err(PhaseError::HumanRejected(ref id, _)) if id == "review"));
        assert_eq!(
            state.phases.get("review").unwrap().error,
            Some("not good enough".to_string())
        );
    }
}

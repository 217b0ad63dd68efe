//! Gate Evaluator (C6, spec §4.6).
//!
//! Dispatches a phase's exit gate by [`GateType`]: `Auto` checks a fixed
//! predicate over the turn's output, `Ai` hands the transcript to a judge
//! turn with a forced decision schema, `Human` parks a [`PendingDecision`]
//! in an in-memory map until the control plane resolves it, `Skip` always
//! approves. Grounded on the teacher's `review::verdict` pass/fail
//! predicate matching and `factory::ws` pending-state bookkeeping, merged
//! into one dispatcher because the spec treats all four as one seam.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use orc_common::gate::{AutoPredicate, GateDecision, GateSource, GateType, PendingDecision};
use orc_common::task::TaskStatus;
use orc_common::{Event, EventType};
use orc_store::Store;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::turn_executor::{ActivitySink, TurnError, TurnExecutor};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("turn error evaluating AI gate: {0}")]
    Turn(#[from] TurnError),
    #[error("human gate {0} was dropped before resolution")]
    Dropped(String),
}

/// Parked human-gate requests. Lost on restart by design (spec §3) — this
/// is a plain in-memory map, never persisted.
pub struct GateEvaluator {
    pending: DashMap<String, (PendingDecision, oneshot::Sender<GateDecision>)>,
    turn_executor: TurnExecutor,
    store: Arc<Store>,
    bus: EventBus,
}

impl GateEvaluator {
    pub fn new(turn_executor: TurnExecutor, store: Arc<Store>, bus: EventBus) -> Self {
        GateEvaluator {
            pending: DashMap::new(),
            turn_executor,
            store,
            bus,
        }
    }

    /// `Auto` gate: all declared predicates must pass.
    pub fn evaluate_auto(
        &self,
        predicates: &[AutoPredicate],
        raw_output: &str,
        is_error: bool,
    ) -> GateDecision {
        let failed: Vec<&str> = predicates
            .iter()
            .filter(|p| !p.eval(raw_output, is_error))
            .map(|p| p.label())
            .collect();

        if failed.is_empty() {
            GateDecision::approve(GateSource::Auto, "all predicates satisfied")
        } else {
            GateDecision::reject(GateSource::Auto, format!("failed predicates: {}", failed.join(", ")))
        }
    }

    /// `Ai` gate: a judge turn forced to emit a `{approved, reason,
    /// questions}` schema. A missing/malformed schema match is propagated
    /// as a hard error, never silently treated as approval or rejection
    /// (spec §4.5's "never silent fallback" carries over to the judge
    /// call).
    pub async fn evaluate_ai(
        &self,
        cwd: &Path,
        judge_prompt: &str,
        sink: &dyn ActivitySink,
    ) -> Result<GateDecision, GateError> {
        let cancel = tokio_util::sync::CancellationToken::new();
        let outcome = self
            .turn_executor
            .run_turn(cwd, judge_prompt, false, true, &cancel, sink)
            .await?;

        let structured = outcome.structured.expect("require_schema guarantees Some");
        let approved = structured.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
        let reason = structured
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("no reason given")
            .to_string();
        let questions: Vec<String> = structured
            .get("questions")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|q| q.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        Ok(if approved {
            GateDecision::approve(GateSource::Ai, reason)
        } else if questions.is_empty() {
            GateDecision::reject(GateSource::Ai, reason)
        } else {
            GateDecision::needs_clarification(GateSource::Ai, reason, questions)
        })
    }

    /// `Human` gate: park a decision and block until the control plane
    /// resolves it via [`Self::resolve`]. The Phase Runner awaits the
    /// returned future; nothing else in the process can make progress on
    /// this phase meanwhile (spec §4.6, §5 "human gates block only the
    /// issuing task").
    pub async fn evaluate_human(
        &self,
        task_id: Uuid,
        phase_id: &str,
        prompt: impl Into<String>,
    ) -> Result<GateDecision, GateError> {
        let decision = PendingDecision::new(task_id, phase_id, prompt);
        let decision_id = decision.decision_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(decision_id.clone(), (decision, tx));

        self.bus.publish(
            Event::new(
                Some(task_id),
                EventType::DecisionRequired,
                serde_json::json!({"decision_id": decision_id}),
                "gate_evaluator",
            )
            .with_phase(phase_id.to_string()),
        );
        self.mark_blocked(task_id, &decision_id);

        rx.await.map_err(|_| GateError::Dropped(decision_id))
    }

    /// Transitions the task to `blocked` while a human decision is parked
    /// (spec §4.6, S3). Uses the same atomic task+state helper as the
    /// Task Executor's own blocked path so the two never race each other
    /// with conflicting bare writes.
    fn mark_blocked(&self, task_id: Uuid, decision_id: &str) {
        let Ok(Some(task)) = self.store.get_task(task_id) else { return };
        if task.status == TaskStatus::Blocked {
            return;
        }
        let state = self.store.get_task_state(task_id).unwrap_or_default();
        if let Err(e) = self.store.block_task(task, state, format!("awaiting human decision {decision_id}")) {
            warn!(error = %e, %task_id, "failed to mark task blocked while parking human gate");
        }
    }

    /// Computes the task's post-decision status per spec §4.6: an approval
    /// clears the block and moves the task back to `planned` for the Task
    /// Executor to pick up; a plain rejection fails the task outright. A
    /// rejection carrying clarifying questions leaves the task `blocked` —
    /// the Task Executor's own `PhaseOutcome::Blocked` handling re-records
    /// the reason once the Phase Runner returns.
    fn apply_resolution_status(&self, task_id: Uuid, decision: &GateDecision) {
        let Ok(Some(task)) = self.store.get_task(task_id) else { return };
        if decision.approved {
            let mut task = task;
            task.status = TaskStatus::Planned;
            if let Err(e) = self.store.update_task(&task) {
                warn!(error = %e, %task_id, "failed to mark task planned after gate approval");
            }
        } else if decision.questions.is_empty() {
            let state = self.store.get_task_state(task_id).unwrap_or_default();
            if let Err(e) = self.store.fail_task(task, state, decision.reason.clone()) {
                warn!(error = %e, %task_id, "failed to mark task failed after gate rejection");
            }
        }
    }

    /// `Skip` gate: always approved, no turn spent.
    pub fn evaluate_skip(&self) -> GateDecision {
        GateDecision::approve(GateSource::Auto, "gate_type=skip")
    }

    /// Resolves a parked human gate (spec §6: `POST /decisions/{id}`).
    /// Returns `false` if no such pending decision exists (already
    /// resolved, or never existed) — callers surface this as a 404, never
    /// a silent no-op that looks like success. Emits `decision_resolved`
    /// and applies the new task status before waking the waiting phase.
    pub fn resolve(&self, decision_id: &str, decision: GateDecision) -> bool {
        let Some((_, (pending, tx))) = self.pending.remove(decision_id) else {
            return false;
        };

        self.bus.publish(
            Event::new(
                Some(pending.task_id),
                EventType::DecisionResolved,
                serde_json::json!({"decision_id": decision_id, "approved": decision.approved}),
                "gate_evaluator",
            )
            .with_phase(pending.phase_id.clone()),
        );
        self.apply_resolution_status(pending.task_id, &decision);

        let _ = tx.send(decision);
        true
    }

    pub fn list_pending(&self) -> Vec<PendingDecision> {
        self.pending.iter().map(|entry| entry.value().0.clone()).collect()
    }

    pub fn dispatch(&self, gate_type: GateType) -> Option<GateDecision> {
        match gate_type {
            GateType::Skip => Some(self.evaluate_skip()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn_executor::TurnTimeouts;

    fn evaluator() -> GateEvaluator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        GateEvaluator::new(
            TurnExecutor::new("/bin/true", "test-model", TurnTimeouts::default()),
            store,
            bus,
        )
    }

    #[test]
    fn has_output_rejects_empty_output() {
        let gate = evaluator();
        let decision = gate.evaluate_auto(&[AutoPredicate::HasOutput], "", false);
        assert!(!decision.approved);
    }

    #[test]
    fn no_errors_rejects_when_is_error_true() {
        let gate = evaluator();
        let decision = gate.evaluate_auto(&[AutoPredicate::NoErrors], "some output", true);
        assert!(!decision.approved);
    }

    #[test]
    fn all_predicates_pass_approves() {
        let gate = evaluator();
        let decision = gate.evaluate_auto(
            &[AutoPredicate::HasOutput, AutoPredicate::NoErrors],
            "done",
            false,
        );
        assert!(decision.approved);
    }

    #[test]
    fn skip_always_approves() {
        let gate = evaluator();
        assert!(gate.evaluate_skip().approved);
    }

    #[tokio::test]
    async fn resolve_unblocks_the_waiting_human_gate() {
        let gate = std::sync::Arc::new(evaluator());
        let task_id = Uuid::new_v4();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.evaluate_human(task_id, "review", "approve this diff?").await })
        };

        // Let the spawned task register its PendingDecision before resolving.
        let decision_id = PendingDecision::make_id(task_id, "review");
        loop {
            if gate.list_pending().iter().any(|p| p.decision_id == decision_id) {
                break;
            }
            tokio::task::yield_now().await;
        }

        let resolved = gate.resolve(&decision_id, GateDecision::approve(GateSource::Human, "looks good"));
        assert!(resolved);

        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn parking_a_human_gate_emits_decision_required_and_blocks_the_task() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let task = store
            .create_task(&orc_common::task::Task::new("t", "d", orc_common::task::Weight::Small))
            .unwrap();
        let mut task_events = bus.subscribe_task(task.id);
        let gate = Arc::new(GateEvaluator::new(
            TurnExecutor::new("/bin/true", "test-model", TurnTimeouts::default()),
            store.clone(),
            bus,
        ));

        let task_id = task.id;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.evaluate_human(task_id, "review", "approve this diff?").await })
        };

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), task_events.recv())
            .await
            .expect("decision_required should be published")
            .unwrap();
        assert_eq!(event.event_type, EventType::DecisionRequired);

        let reloaded = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Blocked);

        let decision_id = PendingDecision::make_id(task_id, "review");
        gate.resolve(&decision_id, GateDecision::approve(GateSource::Human, "lgtm"));
        assert!(waiter.await.unwrap().unwrap().approved);

        let reloaded = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Planned);
    }

    #[tokio::test]
    async fn rejecting_a_human_gate_without_questions_fails_the_task() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new(store.clone());
        let task = store
            .create_task(&orc_common::task::Task::new("t", "d", orc_common::task::Weight::Small))
            .unwrap();
        let gate = Arc::new(GateEvaluator::new(
            TurnExecutor::new("/bin/true", "test-model", TurnTimeouts::default()),
            store.clone(),
            bus,
        ));

        let task_id = task.id;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.evaluate_human(task_id, "review", "approve this diff?").await })
        };

        let decision_id = PendingDecision::make_id(task_id, "review");
        loop {
            if gate.list_pending().iter().any(|p| p.decision_id == decision_id) {
                break;
            }
            tokio::task::yield_now().await;
        }

        gate.resolve(&decision_id, GateDecision::reject(GateSource::Human, "not good enough"));
        assert!(!waiter.await.unwrap().unwrap().approved);

        let reloaded = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Failed);
        let state = store.get_task_state(task_id).unwrap();
        assert_eq!(state.error, "not good enough");
    }

    #[test]
    fn resolving_unknown_decision_returns_false() {
        let gate = evaluator();
        assert!(!gate.resolve("gate_unknown", GateDecision::approve(GateSource::Human, "n/a")));
    }
}

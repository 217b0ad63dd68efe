//! `Task` and `TaskState` (spec §3).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relative sizing used to derive a default workflow when none is given
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

/// Task lifecycle status. See `TaskExecutor` state machine (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Failed,
    Completed,
    Finalizing,
    /// Executor PID not live; not one of the spec's state-diagram labels but
    /// required by §4.8's orphan-detection text ("transition to
    /// `interrupted`") and by testable property 3.
    Interrupted,
}

impl TaskStatus {
    /// Terminal-abnormal statuses that, per testable property 1, require a
    /// non-empty `TaskState.error`.
    pub fn is_terminal_abnormal(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Interrupted)
    }

    pub fn is_running_like(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Finalizing)
    }
}

/// Where a running task's executor is (or was) hosted. A `status=running`
/// task must carry this, or be recognized as orphaned (spec §3 invariant).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub pid: Option<u32>,
    pub host: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Per-kind token counters plus aggregate cost/iteration counts (spec §3
/// "counters").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub tokens_by_kind: BTreeMap<String, u64>,
    pub cost: f64,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub weight: Weight,
    pub category: Option<String>,
    pub priority: i32,
    pub queue: Option<String>,
    pub initiative_id: Option<Uuid>,
    pub blocked_by: BTreeSet<Uuid>,
    pub related_to: BTreeSet<Uuid>,
    pub status: TaskStatus,
    pub current_phase: Option<String>,
    pub execution_info: ExecutionInfo,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_reference: Option<String>,
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, weight: Weight) -> Self {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            weight,
            category: None,
            priority: 0,
            queue: None,
            initiative_id: None,
            blocked_by: BTreeSet::new(),
            related_to: BTreeSet::new(),
            status: TaskStatus::Created,
            current_phase: None,
            execution_info: ExecutionInfo::default(),
            branch: None,
            worktree_path: None,
            pr_reference: None,
            counters: Counters::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Invariant check: status consistent with execution info. Does not by
    /// itself determine orphan status (that requires an external PID
    /// liveness check, owned by the Supervisor) but catches the structurally
    /// inconsistent case of `running` with no recorded PID at all.
    pub fn execution_info_consistent(&self) -> bool {
        if self.status == TaskStatus::Running {
            self.execution_info.pid.is_some()
        } else {
            true
        }
    }
}

/// Per-phase mutable sub-state tracked while (and after) a phase runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSubState {
    pub iteration: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub gate_decision: Option<crate::gate::GateDecision>,
    pub error: Option<String>,
}

/// Conflict data captured when a sync/rebase fails (spec §4.9, S6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub step: String,
    pub conflicted_files: Vec<String>,
    pub remediation: Vec<String>,
}

/// Per-task mutable execution record (spec §3).
///
/// Invariant enforced by construction helpers only (never by callers
/// directly mutating fields): on any failure path both `Task.status` and
/// `TaskState.error` are written atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub current_phase: Option<String>,
    pub phases: BTreeMap<String, PhaseSubState>,
    pub error: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub sync_conflict: Option<SyncConflict>,
}

impl TaskState {
    pub fn phase_mut(&mut self, phase_id: &str) -> &mut PhaseSubState {
        self.phases.entry(phase_id.to_string()).or_default()
    }

    pub fn all_phases_complete(&self, ordered_ids: &[String]) -> bool {
        ordered_ids
            .iter()
            .all(|id| self.phases.get(id).is_some_and(|p| p.completed_at.is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_created_with_no_execution_info() {
        let task = Task::new("title", "desc", Weight::Medium);
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.execution_info.pid.is_none());
        assert!(task.execution_info_consistent());
    }

    #[test]
    fn running_task_without_pid_is_structurally_inconsistent() {
        let mut task = Task::new("title", "desc", Weight::Small);
        task.status = TaskStatus::Running;
        assert!(!task.execution_info_consistent());
        task.execution_info.pid = Some(1234);
        assert!(task.execution_info_consistent());
    }

    #[test]
    fn terminal_abnormal_statuses() {
        assert!(TaskStatus::Failed.is_terminal_abnormal());
        assert!(TaskStatus::Interrupted.is_terminal_abnormal());
        assert!(!TaskStatus::Completed.is_terminal_abnormal());
        assert!(!TaskStatus::Blocked.is_terminal_abnormal());
    }

    #[test]
    fn all_phases_complete_requires_every_ordered_phase_to_have_completed_at() {
        let mut state = TaskState::default();
        state.phase_mut("spec").completed_at = Some(Utc::now());
        let ordered = vec!["spec".to_string(), "implement".to_string()];
        assert!(!state.all_phases_complete(&ordered));
        state.phase_mut("implement").completed_at = Some(Utc::now());
        assert!(state.all_phases_complete(&ordered));
    }
}

//! Gate evaluation types (spec §3, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a phase's exit gate is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Auto,
    Ai,
    Human,
    Skip,
}

/// Where a `GateDecision` originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSource {
    Auto,
    Ai,
    Human,
    Api,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    pub reason: String,
    pub questions: Vec<String>,
    pub source: GateSource,
}

impl GateDecision {
    pub fn approve(source: GateSource, reason: impl Into<String>) -> Self {
        GateDecision {
            approved: true,
            reason: reason.into(),
            questions: Vec::new(),
            source,
        }
    }

    pub fn reject(source: GateSource, reason: impl Into<String>) -> Self {
        GateDecision {
            approved: false,
            reason: reason.into(),
            questions: Vec::new(),
            source,
        }
    }

    pub fn needs_clarification(
        source: GateSource,
        reason: impl Into<String>,
        questions: Vec<String>,
    ) -> Self {
        GateDecision {
            approved: false,
            reason: reason.into(),
            questions,
            source,
        }
    }
}

/// Auto-gate predicates (spec §4.6): a phase declares which of these it
/// wants evaluated against the turn's raw output; unlisted predicates are
/// never checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPredicate {
    HasOutput,
    NoErrors,
    HasCompletionMarker,
}

impl AutoPredicate {
    pub fn eval(self, raw_output: &str, is_error: bool) -> bool {
        match self {
            AutoPredicate::HasOutput => !raw_output.trim().is_empty(),
            AutoPredicate::NoErrors => !is_error,
            AutoPredicate::HasCompletionMarker => raw_output.contains("<promise>") || raw_output.contains("DONE"),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AutoPredicate::HasOutput => "has_output",
            AutoPredicate::NoErrors => "no_errors",
            AutoPredicate::HasCompletionMarker => "has_completion_marker",
        }
    }
}

/// Default predicate set for phases that don't declare their own (spec
/// §4.6's own worked examples always check these two).
pub fn default_auto_predicates() -> Vec<AutoPredicate> {
    vec![AutoPredicate::HasOutput, AutoPredicate::NoErrors]
}

/// An outstanding human-gate request. Kept in an in-memory concurrent map
/// only — spec §3: "lost on restart by design".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub decision_id: String,
    pub task_id: uuid::Uuid,
    pub phase_id: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl PendingDecision {
    /// Synthetic decision ID format mandated by spec §3: `gate_<task>_<phase>`.
    pub fn make_id(task_id: uuid::Uuid, phase_id: &str) -> String {
        format!("gate_{task_id}_{phase_id}")
    }

    pub fn new(task_id: uuid::Uuid, phase_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let phase_id = phase_id.into();
        PendingDecision {
            decision_id: Self::make_id(task_id, &phase_id),
            task_id,
            phase_id,
            prompt: prompt.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_id_format() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            PendingDecision::make_id(id, "review"),
            format!("gate_{id}_review")
        );
    }

    #[test]
    fn approve_has_no_questions() {
        let d = GateDecision::approve(GateSource::Auto, "has output");
        assert!(d.approved);
        assert!(d.questions.is_empty());
    }

    #[test]
    fn needs_clarification_is_not_approved() {
        let d = GateDecision::needs_clarification(
            GateSource::Ai,
            "ambiguous",
            vec!["which database?".into()],
        );
        assert!(!d.approved);
        assert_eq!(d.questions.len(), 1);
    }
}

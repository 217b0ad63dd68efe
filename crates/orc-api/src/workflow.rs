//! Weight-derived default workflow (spec §3 "a workflow is selected per
//! task, explicit or weight-derived") and the minimal [`PhaseMaterials`]
//! implementation the thin control plane hands the Task Executor. Real
//! prompt-template and skill-file authoring is out of scope for this
//! crate (spec §1 "prompt templates, skills/hook-script seeding" are
//! external collaborator concerns); this supplies plain placeholders so
//! the phase pipeline itself has something concrete to run.

use std::path::PathBuf;

use orc_common::gate::GateType;
use orc_common::phase::{ArtifactType, Phase, Workflow};
use orc_common::task::Weight;
use orc_runtime::config_applier::PhaseClaudeConfig;
use orc_runtime::task_executor::PhaseMaterials;

/// Every weight runs `spec -> implement -> review`; heavier weights add a
/// research phase up front and a human-gated finalize step at the end,
/// mirroring the teacher's budget-scaling-by-size idea (`phase.rs`'s
/// per-phase `budget` field) without the domain-specific auth-app phase
/// list that accompanied it.
pub fn default_workflow_for(weight: Weight) -> Workflow {
    let mut phases = Vec::new();

    if matches!(weight, Weight::Large | Weight::Greenfield) {
        phases.push(
            Phase::new("research", "research", GateType::Auto)
                .with_max_iterations(3)
                .with_artifact(ArtifactType::Design),
        );
    }

    let spec_depends = if phases.is_empty() { vec![] } else { vec!["research".to_string()] };
    phases.push(
        Phase::new("spec", "spec", GateType::Ai)
            .with_depends_on(spec_depends)
            .with_max_iterations(max_iterations_for(weight))
            .with_artifact(ArtifactType::Spec),
    );

    phases.push(
        Phase::new("implement", "implement", GateType::Auto)
            .with_depends_on(vec!["spec".to_string()])
            .with_max_iterations(max_iterations_for(weight) * 2),
    );

    phases.push(
        Phase::new("review", "review", GateType::Ai)
            .with_depends_on(vec!["implement".to_string()])
            .with_max_iterations(max_iterations_for(weight))
            .with_artifact(ArtifactType::ReviewFindings),
    );

    if matches!(weight, Weight::Large | Weight::Greenfield) {
        phases.push(
            Phase::new("finalize", "finalize", GateType::Human)
                .with_depends_on(vec!["review".to_string()])
                .with_max_iterations(1),
        );
    }

    Workflow::new(format!("default-{weight:?}").to_lowercase(), phases)
}

fn max_iterations_for(weight: Weight) -> u32 {
    match weight {
        Weight::Trivial => 1,
        Weight::Small => 3,
        Weight::Medium => 5,
        Weight::Large => 8,
        Weight::Greenfield => 10,
    }
}

/// Placeholder prompt/config source until a real template store exists.
/// `prompt_template` just names the phase; the Turn Executor substitutes
/// `{{task.title}}` etc. into it per [`orc_runtime::phase_runner::PhaseRunner::render_prompt`]'s
/// doc comment.
pub struct PlaceholderMaterials;

impl PhaseMaterials for PlaceholderMaterials {
    fn prompt_template(&self, phase: &Phase) -> String {
        format!(
            "Phase {{{{phase.template_id}}}} for task \"{{{{task.title}}}}\": {{{{task.description}}}}. (phase id: {})",
            phase.id
        )
    }

    fn claude_config(&self, _phase: &Phase) -> PhaseClaudeConfig {
        PhaseClaudeConfig::default()
    }

    fn skill_files(&self, _phase: &Phase) -> Vec<(String, String)> {
        Vec::new()
    }

    fn source_committed_claude_dir(&self) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_weight_workflow_has_no_research_or_finalize() {
        let wf = default_workflow_for(Weight::Small);
        assert!(wf.phase("research").is_none());
        assert!(wf.phase("finalize").is_none());
        assert!(wf.phase("spec").is_some());
        wf.validate().unwrap();
    }

    #[test]
    fn greenfield_weight_workflow_adds_research_and_finalize() {
        let wf = default_workflow_for(Weight::Greenfield);
        assert!(wf.phase("research").is_some());
        assert!(wf.phase("finalize").is_some());
        let order = wf.topological_order().unwrap();
        assert_eq!(order.first().unwrap(), "research");
        assert_eq!(order.last().unwrap(), "finalize");
    }
}

//! `Phase`, `Workflow`, and `Artifact` (spec §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::{default_auto_predicates, AutoPredicate, GateType};

/// The artifact kind a phase produces, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Spec,
    Design,
    Breakdown,
    TddTests,
    ReviewFindings,
    FinalizeReport,
}

/// A phase-produced document, persisted in the Store keyed by
/// (task, phase, artifact-type). Never written to the working tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: uuid::Uuid,
    pub phase_id: String,
    pub artifact_type: ArtifactType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Model/thinking overrides a phase may apply over workflow/project
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub agent: Option<String>,
    pub sub_agent: Option<String>,
}

/// An ordered step in a task's pipeline, identified by a template ID
/// (spec §3: `spec`, `tdd_write`, `breakdown`, `implement`, `review`,
/// `test`, `validate`, `finalize`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub template_id: String,
    pub max_iterations: u32,
    pub gate_type: GateType,
    pub overrides: ModelOverrides,
    pub produces_artifact: bool,
    pub artifact_type: Option<ArtifactType>,
    pub depends_on: Vec<String>,
    /// Evaluation semantics deliberately unspecified upstream (spec §9 open
    /// question); see DESIGN.md for the chosen evaluation contract.
    pub condition: Option<String>,
    /// Declared criteria for this phase's `Auto` gate (spec §4.6). Ignored
    /// for other gate types.
    #[serde(default = "default_auto_predicates")]
    pub auto_predicates: Vec<AutoPredicate>,
}

impl Phase {
    pub fn new(id: impl Into<String>, template_id: impl Into<String>, gate_type: GateType) -> Self {
        Phase {
            id: id.into(),
            template_id: template_id.into(),
            max_iterations: 10,
            gate_type,
            overrides: ModelOverrides::default(),
            produces_artifact: false,
            artifact_type: None,
            depends_on: Vec::new(),
            condition: None,
            auto_predicates: default_auto_predicates(),
        }
    }

    pub fn with_auto_predicates(mut self, predicates: Vec<AutoPredicate>) -> Self {
        self.auto_predicates = predicates;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_artifact(mut self, artifact_type: ArtifactType) -> Self {
        self.produces_artifact = true;
        self.artifact_type = Some(artifact_type);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }
}

/// An ordered/graph assembly of phases selected for a task (explicit or
/// weight-derived). Invariant: acyclic; all `depends_on` resolve within the
/// workflow (enforced by [`Workflow::validate`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub phases: Vec<Phase>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, phases: Vec<Phase>) -> Self {
        Workflow { id: id.into(), phases }
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Validates both that every `depends_on` reference resolves within
    /// this workflow and that the dependency graph is acyclic (spec §3
    /// invariant, testable property 5).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let ids: BTreeMap<&str, &Phase> = self.phases.iter().map(|p| (p.id.as_str(), p)).collect();
        for phase in &self.phases {
            for dep in &phase.depends_on {
                if !ids.contains_key(dep.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        self.check_acyclic(&ids)
    }

    fn check_acyclic(&self, ids: &BTreeMap<&str, &Phase>) -> Result<(), WorkflowError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        fn visit<'a>(
            id: &'a str,
            ids: &BTreeMap<&'a str, &'a Phase>,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<(), WorkflowError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(WorkflowError::Cycle { phase: id.to_string() });
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(phase) = ids.get(id) {
                for dep in &phase.depends_on {
                    visit(dep, ids, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in ids.keys() {
            visit(id, ids, &mut marks)?;
        }
        Ok(())
    }

    /// Topological order respecting `depends_on`. Ties broken by declaration
    /// order, since spec §5 disables intra-task parallelism regardless.
    pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
        self.validate()?;
        let ids: BTreeMap<&str, &Phase> = self.phases.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut order = Vec::with_capacity(self.phases.len());
        let mut done: BTreeMap<&str, bool> = BTreeMap::new();

        fn visit<'a>(
            id: &'a str,
            ids: &BTreeMap<&'a str, &'a Phase>,
            done: &mut BTreeMap<&'a str, bool>,
            order: &mut Vec<String>,
        ) {
            if done.get(id).copied().unwrap_or(false) {
                return;
            }
            done.insert(id, true);
            if let Some(phase) = ids.get(id) {
                for dep in &phase.depends_on {
                    visit(dep, ids, done, order);
                }
            }
            order.push(id.to_string());
        }

        for phase in &self.phases {
            visit(&phase.id, &ids, &mut done, &mut order);
        }
        Ok(order)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },
    #[error("cycle detected involving phase {phase}")]
    Cycle { phase: String },
}

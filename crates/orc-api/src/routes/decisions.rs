//! Pending human-gate decisions (spec §4.6, §6).

use axum::extract::{Path, State};
use axum::Json;
use orc_common::gate::{GateDecision, GateSource, PendingDecision};
use serde::Deserialize;

use crate::{ApiError, SharedState};

pub async fn list_pending(State(state): State<SharedState>) -> Json<Vec<PendingDecision>> {
    Json(state.phase_runner.gate_evaluator().list_pending())
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub questions: Vec<String>,
}

pub async fn resolve(
    State(state): State<SharedState>,
    Path(decision_id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<(), ApiError> {
    let decision = if req.approved {
        GateDecision::approve(GateSource::Human, req.reason)
    } else if !req.questions.is_empty() {
        GateDecision::needs_clarification(GateSource::Human, req.reason, req.questions)
    } else {
        GateDecision::reject(GateSource::Human, req.reason)
    };

    if state.phase_runner.gate_evaluator().resolve(&decision_id, decision) {
        Ok(())
    } else {
        Err(ApiError::NotFound(decision_id))
    }
}

//! Structured error envelope for the HTTP surface (spec §6, §7).
//!
//! Every handler failure becomes a `{error, message}` JSON body with a
//! status code chosen from the error taxonomy, except the one shape the
//! spec pins down exactly: `task_blocked` (spec §6, testable property 6),
//! which additionally carries `blocked_by` and `force_available`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orc_common::error::{Classify, ErrorKind};
use orc_runtime::supervisor::{AdmissionError, BlockerInfo};

pub enum ApiError {
    Store(orc_store::StoreError),
    Admission(AdmissionError),
    TaskExec(orc_runtime::task_executor::TaskExecError),
    Worktree(orc_runtime::worktree_manager::WorktreeError),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl From<orc_store::StoreError> for ApiError {
    fn from(e: orc_store::StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        ApiError::Admission(e)
    }
}

impl From<orc_runtime::task_executor::TaskExecError> for ApiError {
    fn from(e: orc_runtime::task_executor::TaskExecError) -> Self {
        ApiError::TaskExec(e)
    }
}

impl From<orc_runtime::worktree_manager::WorktreeError> for ApiError {
    fn from(e: orc_runtime::worktree_manager::WorktreeError) -> Self {
        ApiError::Worktree(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Input => StatusCode::BAD_REQUEST,
        ErrorKind::Precondition => StatusCode::CONFLICT,
        ErrorKind::Parse => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::External => StatusCode::BAD_GATEWAY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvariantViolation => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Admission(AdmissionError::Blocked { blockers }) => {
                #[derive(serde::Serialize)]
                struct TaskBlockedBody {
                    error: &'static str,
                    message: String,
                    blocked_by: Vec<BlockerInfo>,
                    force_available: bool,
                }
                let body = TaskBlockedBody {
                    error: "task_blocked",
                    message: "task has incomplete blockers".to_string(),
                    blocked_by: blockers,
                    force_available: true,
                };
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            ApiError::Admission(AdmissionError::Store(e)) | ApiError::Store(e) => {
                let status = status_for(e.kind());
                (status, Json(envelope("store_error", e.to_string()))).into_response()
            }
            ApiError::TaskExec(e) => {
                let status = status_for(e.kind());
                (status, Json(envelope("task_error", e.to_string()))).into_response()
            }
            ApiError::Worktree(e) => {
                let status = status_for(e.kind());
                (status, Json(envelope("worktree_error", e.to_string()))).into_response()
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, Json(envelope("not_found", msg))).into_response(),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(envelope("bad_request", msg))).into_response()
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, Json(envelope("conflict", msg))).into_response(),
        }
    }
}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

fn envelope(error: &str, message: String) -> ErrorBody {
    ErrorBody { error: error.to_string(), message }
}

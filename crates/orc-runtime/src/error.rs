use orc_common::error::{Classify, ErrorKind};
use thiserror::Error;

/// Errors shared across the runtime components. Subsystem-specific detail
/// (git plumbing, process spawn, schema parse) lives in narrower enums
/// per module; this is the type that crosses module boundaries inside
/// `orc-runtime` (Task Executor calling into Phase Runner calling into
/// Turn Executor, etc.).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] orc_store::StoreError),

    #[error("worktree error: {0}")]
    Worktree(#[from] crate::worktree_manager::WorktreeError),

    #[error("turn error: {0}")]
    Turn(#[from] crate::turn_executor::TurnError),

    #[error("phase error: {0}")]
    Phase(#[from] crate::phase_runner::PhaseError),

    #[error("sync error: {0}")]
    Sync(#[from] crate::sync_finalize::SyncError),

    #[error("{0}")]
    Other(String),
}

impl Classify for RuntimeError {
    fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Store(e) => e.kind(),
            RuntimeError::Worktree(e) => e.kind(),
            RuntimeError::Turn(e) => e.kind(),
            RuntimeError::Phase(e) => e.kind(),
            RuntimeError::Sync(e) => e.kind(),
            RuntimeError::Other(_) => ErrorKind::InvariantViolation,
        }
    }
}

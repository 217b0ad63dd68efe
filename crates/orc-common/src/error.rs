//! Error taxonomy shared across all subsystems (spec §7).
//!
//! Subsystem crates define their own `thiserror` enums (`StoreError`,
//! `WorktreeError`, `TurnError`, ...); each implements [`ErrorKind`] so
//! callers at a component boundary can classify without matching on every
//! concrete variant. `CoreError` is the boundary-crossing wrapper used by
//! anything that sits above a single subsystem (Task Executor, Supervisor,
//! the CLI driver).

use thiserror::Error;

/// The eight error kinds from the error taxonomy. Not a type name hierarchy
/// — every subsystem error maps onto one of these via [`ErrorKind::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Input,
    Precondition,
    Parse,
    Timeout,
    Cancelled,
    External,
    Conflict,
    InvariantViolation,
}

impl ErrorKind {
    /// Whether this kind is, in principle, retryable by the caller without
    /// operator intervention. `External` is the only kind that can go
    /// either way; subsystems that need finer granularity carry their own
    /// `retryable: bool` alongside the kind.
    pub fn retryable_by_default(self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }
}

/// Implemented by every subsystem error enum so a boundary caller can
/// classify an error without depending on the subsystem's concrete type.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Boundary-crossing error type. Anything that calls into more than one
/// subsystem (Task Executor spanning Phase Runner + Worktree Manager +
/// Store, Supervisor spanning Task Executor + Store, the CLI driver)
/// reports failures through this type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("{kind:?}: {message}")]
    Classified { kind: ErrorKind, message: String },
}

impl CoreError {
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        CoreError::Classified {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Store(_) => ErrorKind::External,
            CoreError::Classified { kind, .. } => *kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable_by_default() {
        assert!(ErrorKind::Timeout.retryable_by_default());
        assert!(!ErrorKind::InvariantViolation.retryable_by_default());
    }

    #[test]
    fn classified_core_error_reports_its_kind() {
        let err = CoreError::classified(ErrorKind::Conflict, "rebase conflict in CLAUDE.md");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("rebase conflict"));
    }
}

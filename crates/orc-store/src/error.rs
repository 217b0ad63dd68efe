use orc_common::error::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("row not found after write")]
    NotFound,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("task {0} cannot block itself")]
    SelfReference(uuid::Uuid),

    #[error("blocked_by edge from {from} to {to} would introduce a cycle")]
    CyclicDependency { from: uuid::Uuid, to: uuid::Uuid },

    #[error("blocked_by references unknown task {0}")]
    UnknownBlockedBy(uuid::Uuid),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Sqlite(_) | StoreError::Io(_) => ErrorKind::External,
            StoreError::NotFound => ErrorKind::InvariantViolation,
            StoreError::Corrupt(_) => ErrorKind::InvariantViolation,
            StoreError::SelfReference(_)
            | StoreError::CyclicDependency { .. }
            | StoreError::UnknownBlockedBy(_) => ErrorKind::Precondition,
        }
    }
}

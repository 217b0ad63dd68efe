//! `Worktree` (spec §3, §4.3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeLifecycle {
    Created,
    Active,
    Removed,
    RetainedAfterFailure,
}

/// A materialized checkout of a task's branch from the source branch,
/// identified by (task ID, optional initiative prefix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub task_id: Uuid,
    pub initiative_prefix: Option<String>,
    pub path: String,
    pub branch: String,
    pub source_branch: String,
    pub lifecycle: WorktreeLifecycle,
}

impl Worktree {
    pub fn new(
        task_id: Uuid,
        initiative_prefix: Option<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
        source_branch: impl Into<String>,
    ) -> Self {
        Worktree {
            task_id,
            initiative_prefix,
            path: path.into(),
            branch: branch.into(),
            source_branch: source_branch.into(),
            lifecycle: WorktreeLifecycle::Created,
        }
    }
}

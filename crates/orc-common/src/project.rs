//! `Project` — a registry entry mapping project ID to filesystem root
//! (spec §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Empty string means "CWD-derived legacy project" per spec §3.
    pub id: String,
    pub root: String,
    pub name: Option<String>,
}

impl Project {
    pub fn is_legacy(&self) -> bool {
        self.id.is_empty()
    }
}

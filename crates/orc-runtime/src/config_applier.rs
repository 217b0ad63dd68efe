//! Phase Config Applier (C4, spec §4.4).
//!
//! Generalizes the teacher's `hooks::manager`/`hooks::config` additive
//! merge (`HooksConfig::merge` extending the hook vector, glob `r#match`
//! against phase name via `pattern_matches`) into the full per-phase
//! settings-document lifecycle: reset -> layer settings -> write hook/skill
//! files -> hand off -> reset. No state persists across phases; every
//! method here is called fresh per phase.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const CLAUDE_DIR: &str = ".claude";
const SETTINGS_FILE: &str = "settings.json";

/// A phase's declared settings layer (hooks, MCP servers, environment),
/// analogous to the teacher's `ForgeToml` phase overrides but scoped to
/// what gets merged into `.claude/settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseClaudeConfig {
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The orc isolation hook, always appended ahead of the phase's own hooks
/// (spec §4.4 step 2).
fn isolation_hook() -> Value {
    serde_json::json!({
        "name": "orc-isolation-guard",
        "managed_by": "orc",
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigApplierError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct PhaseConfigApplier {
    worktree_path: PathBuf,
}

impl PhaseConfigApplier {
    pub fn new(worktree_path: impl Into<PathBuf>) -> Self {
        PhaseConfigApplier { worktree_path: worktree_path.into() }
    }

    fn claude_dir(&self) -> PathBuf {
        self.worktree_path.join(CLAUDE_DIR)
    }

    /// Step 1: reset the in-worktree config directory to the source
    /// branch's committed contents. Missing source-branch config directory
    /// falls back to deleting injected files and recreating empty (spec
    /// §4.4).
    pub fn reset(&self, source_committed_claude_dir: Option<&Path>) -> Result<(), ConfigApplierError> {
        let dir = self.claude_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        match source_committed_claude_dir {
            Some(source) if source.exists() => {
                copy_dir_recursive(source, &dir)?;
            }
            _ => {
                std::fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Step 2-3: apply the merged settings document and materialize
    /// referenced hook/skill files. Merge rules (spec §4.4, strict):
    /// - hook arrays are additive (never overwrite project hooks);
    /// - MCP servers and env merge with phase-wins on key collision.
    pub fn apply(
        &self,
        phase_config: &PhaseClaudeConfig,
        skill_files: &[(String, String)],
    ) -> Result<(), ConfigApplierError> {
        let dir = self.claude_dir();
        std::fs::create_dir_all(&dir)?;

        let settings_path = dir.join(SETTINGS_FILE);
        let mut project_settings: Value = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content)?
        } else {
            serde_json::json!({})
        };

        let merged = Self::merge_settings(&mut project_settings, phase_config);
        std::fs::write(&settings_path, serde_json::to_string_pretty(&merged)?)?;

        for (rel_path, content) in skill_files {
            let dest = dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, content)?;
        }

        Ok(())
    }

    fn merge_settings(project_settings: &mut Value, phase_config: &PhaseClaudeConfig) -> Value {
        let obj = project_settings.as_object_mut().expect("settings.json root is an object");

        // Hooks: additive. Project hooks are preserved; orc's isolation
        // hook and the phase's declared hooks are appended.
        let hooks_obj = obj
            .entry("hooks")
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
            .expect("hooks field is an object");
        for (event, phase_hooks) in &phase_config.hooks {
            let existing = hooks_obj
                .entry(event.clone())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .expect("hook event field is an array");
            existing.push(isolation_hook());
            existing.extend(phase_hooks.iter().cloned());
        }

        // MCP servers: merge, phase wins on key collision.
        let mcp_obj = obj
            .entry("mcpServers")
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
            .expect("mcpServers field is an object");
        for (key, value) in &phase_config.mcp_servers {
            mcp_obj.insert(key.clone(), value.clone());
        }

        // Environment: merge, phase wins on key collision.
        let env_obj = obj
            .entry("env")
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
            .expect("env field is an object");
        for (key, value) in &phase_config.env {
            env_obj.insert(key.clone(), Value::String(value.clone()));
        }

        project_settings.clone()
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_without_source_recreates_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let applier = PhaseConfigApplier::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".claude")).unwrap();
        std::fs::write(dir.path().join(".claude/stale.json"), "{}").unwrap();

        applier.reset(None).unwrap();

        assert!(dir.path().join(".claude").exists());
        assert!(!dir.path().join(".claude/stale.json").exists());
    }

    #[test]
    fn reset_restores_source_branch_contents() {
        let worktree = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("settings.json"), r#"{"hooks":{}}"#).unwrap();

        let applier = PhaseConfigApplier::new(worktree.path());
        applier.reset(Some(source.path())).unwrap();

        let restored = std::fs::read_to_string(worktree.path().join(".claude/settings.json")).unwrap();
        assert_eq!(restored, r#"{"hooks":{}}"#);
    }

    #[test]
    fn hooks_are_additive_never_overwriting_project_hooks() {
        let worktree = tempfile::tempdir().unwrap();
        let applier = PhaseConfigApplier::new(worktree.path());
        std::fs::create_dir_all(worktree.path().join(".claude")).unwrap();
        std::fs::write(
            worktree.path().join(".claude/settings.json"),
            serde_json::json!({"hooks": {"PreToolUse": [{"name": "project-hook"}]}}).to_string(),
        )
        .unwrap();

        let mut phase_config = PhaseClaudeConfig::default();
        phase_config
            .hooks
            .insert("PreToolUse".into(), vec![serde_json::json!({"name": "phase-hook"})]);

        applier.apply(&phase_config, &[]).unwrap();

        let content = std::fs::read_to_string(worktree.path().join(".claude/settings.json")).unwrap();
        let settings: Value = serde_json::from_str(&content).unwrap();
        let pre_tool_use = settings["hooks"]["PreToolUse"].as_array().unwrap();

        assert!(pre_tool_use.iter().any(|h| h["name"] == "project-hook"));
        assert!(pre_tool_use.iter().any(|h| h["name"] == "phase-hook"));
        assert!(pre_tool_use.iter().any(|h| h["managed_by"] == "orc"));
    }

    #[test]
    fn mcp_servers_and_env_are_phase_wins_on_collision() {
        let worktree = tempfile::tempdir().unwrap();
        let applier = PhaseConfigApplier::new(worktree.path());
        std::fs::create_dir_all(worktree.path().join(".claude")).unwrap();
        std::fs::write(
            worktree.path().join(".claude/settings.json"),
            serde_json::json!({"mcpServers": {"db": "project-value"}, "env": {"MODE": "project"}})
                .to_string(),
        )
        .unwrap();

        let mut phase_config = PhaseClaudeConfig::default();
        phase_config.mcp_servers.insert("db".into(), serde_json::json!("phase-value"));
        phase_config.env.insert("MODE".into(), "phase".into());

        applier.apply(&phase_config, &[]).unwrap();

        let content = std::fs::read_to_string(worktree.path().join(".claude/settings.json")).unwrap();
        let settings: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(settings["mcpServers"]["db"], "phase-value");
        assert_eq!(settings["env"]["MODE"], "phase");
    }

    #[test]
    fn skill_files_are_materialized_into_claude_dir() {
        let worktree = tempfile::tempdir().unwrap();
        let applier = PhaseConfigApplier::new(worktree.path());
        applier
            .apply(&PhaseClaudeConfig::default(), &[("skills/test-writer.md".into(), "# test writer".into())])
            .unwrap();

        let content = std::fs::read_to_string(worktree.path().join(".claude/skills/test-writer.md")).unwrap();
        assert_eq!(content, "# test writer");
    }
}

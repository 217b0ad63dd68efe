//! Project and global configuration (spec §6, SPEC_FULL §0).
//!
//! Two files: `<root>/.orc/config.yaml` (per-project knobs) and
//! `<home>/.orc/projects.yaml` (the registry of known project roots, so
//! `orc list`/`orc status` without a `--project-dir` can find recently used
//! projects). Generalizes `forge_config.rs`'s `ProjectConfig` +
//! `DefaultsConfig` layering into the flat knob set spec §9 enumerates,
//! loaded with `serde_yaml` instead of `toml` since project config now lives
//! at `config.yaml` per spec §6.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_turn_max_secs() -> u64 {
    600
}
fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_phase_max_secs() -> u64 {
    45 * 60
}
fn default_max_iterations() -> u32 {
    8
}
fn default_max_parallel() -> usize {
    4
}
fn default_target_branch() -> String {
    "main".to_string()
}
fn default_model() -> String {
    "claude".to_string()
}
fn default_claude_bin() -> String {
    "claude".to_string()
}
fn default_memory_threshold_mb() -> u64 {
    2048
}
fn default_snapshot_interval_secs() -> u64 {
    60
}
fn default_merge_backoff_secs() -> Vec<u64> {
    vec![2, 4]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_turn_max_secs")]
    pub turn_max_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_phase_max_secs")]
    pub phase_max_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            turn_max_secs: default_turn_max_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            phase_max_secs: default_phase_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig { target_branch: default_target_branch() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    #[serde(default = "default_merge_backoff_secs")]
    pub merge_retry_backoff_secs: Vec<u64>,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        FinalizeConfig { merge_retry_backoff_secs: default_merge_backoff_secs() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTrackingConfig {
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default)]
    pub watched_patterns: Vec<String>,
}

impl Default for ResourceTrackingConfig {
    fn default() -> Self {
        ResourceTrackingConfig {
            memory_threshold_mb: default_memory_threshold_mb(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            watched_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub resource_tracking: ResourceTrackingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub auto_approve_threshold: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        AutomationConfig {
            max_iterations: default_max_iterations(),
            auto_approve_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        WorktreeConfig { max_parallel: default_max_parallel() }
    }
}

/// `<root>/.orc/config.yaml`. Every field has a conservative default so an
/// absent or partial file is as valid as a fully-specified one, matching
/// `forge_config.rs`'s "missing file means defaults" behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrcConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_claude_bin")]
    pub claude_bin: String,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
}

impl OrcConfig {
    /// Loads `<root>/.orc/config.yaml`, falling back to defaults if the
    /// file does not exist. A present-but-malformed file is an error: a
    /// typo in hand-edited YAML should be surfaced, not silently ignored.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::path(project_root);
        if !path.exists() {
            return Ok(OrcConfig::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join(".orc").join("config.yaml")
    }

    pub fn orc_dir(project_root: &Path) -> PathBuf {
        project_root.join(".orc")
    }

    pub fn store_path(project_root: &Path) -> PathBuf {
        Self::orc_dir(project_root).join("orc.db")
    }

    pub fn ensure_directories(project_root: &Path) -> Result<()> {
        let orc_dir = Self::orc_dir(project_root);
        std::fs::create_dir_all(&orc_dir)
            .with_context(|| format!("creating {}", orc_dir.display()))?;
        std::fs::create_dir_all(orc_dir.join("worktrees"))?;
        std::fs::create_dir_all(orc_dir.join("logs"))?;
        Ok(())
    }

    pub fn save(&self, project_root: &Path) -> Result<()> {
        Self::ensure_directories(project_root)?;
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(Self::path(project_root), yaml)?;
        Ok(())
    }
}

/// `<home>/.orc/projects.yaml`. A flat registry of known project roots so
/// `orc list --all-projects`-style lookups don't require a `--project-dir`
/// every time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRegistry {
    #[serde(default)]
    pub projects: Vec<PathBuf>,
}

impl ProjectRegistry {
    fn path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("could not resolve home directory")?;
        Ok(home.join(".orc").join("projects.yaml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(ProjectRegistry::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn remember(&mut self, project_root: &Path) -> Result<()> {
        let canonical = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        if !self.projects.contains(&canonical) {
            self.projects.push(canonical);
        }
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrcConfig::load(dir.path()).unwrap();
        assert_eq!(config.timeouts.turn_max_secs, 600);
        assert_eq!(config.worktree.max_parallel, 4);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrcConfig::default();
        config.timeouts.turn_max_secs = 900;
        config.automation.auto_approve_threshold = 3;
        config.save(dir.path()).unwrap();

        let loaded = OrcConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.timeouts.turn_max_secs, 900);
        assert_eq!(loaded.automation.auto_approve_threshold, 3);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        OrcConfig::ensure_directories(dir.path()).unwrap();
        std::fs::write(
            OrcConfig::path(dir.path()),
            "timeouts:\n  turn_max_secs: 120\n",
        )
        .unwrap();

        let config = OrcConfig::load(dir.path()).unwrap();
        assert_eq!(config.timeouts.turn_max_secs, 120);
        assert_eq!(config.timeouts.idle_timeout_secs, 120);
        assert_eq!(config.worktree.max_parallel, 4);
    }

    #[test]
    fn ensure_directories_creates_worktrees_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        OrcConfig::ensure_directories(dir.path()).unwrap();
        assert!(dir.path().join(".orc").join("worktrees").is_dir());
        assert!(dir.path().join(".orc").join("logs").is_dir());
    }
}

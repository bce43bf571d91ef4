//! Campaign definition: phases, tools, success criteria and safety settings.
//!
//! Loaded from YAML and validated once; immutable afterwards.

use crate::types::SafetyLevel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CampaignConfigError {
    #[error("failed to read campaign file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse campaign file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("campaign defines no phases")]
    NoPhases,
    #[error("duplicate phase id: {0}")]
    DuplicatePhase(String),
    #[error("phase {0} defines no tools")]
    NoTools(String),
    #[error("phase {0} is missing success criteria")]
    MissingCriteria(String),
    #[error("unknown phase id: {0}")]
    UnknownPhase(String),
}

pub type Result<T> = std::result::Result<T, CampaignConfigError>;

/// Top-level campaign definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub phases: Vec<CampaignPhase>,
    pub safety: SafetySettings,
    pub targets: ProgressTargets,
    pub tools: ToolPaths,
}

impl CampaignConfig {
    /// Load and validate a campaign from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural requirements: phases exist, ids are unique, every phase
    /// has tools and a usable success-criteria block.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(CampaignConfigError::NoPhases);
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(CampaignConfigError::DuplicatePhase(phase.id.clone()));
            }
            if phase.tools.is_empty() {
                return Err(CampaignConfigError::NoTools(phase.id.clone()));
            }
            if phase.success_criteria.is_empty() {
                return Err(CampaignConfigError::MissingCriteria(phase.id.clone()));
            }
        }
        Ok(())
    }

    pub fn phase(&self, id: &str) -> Result<&CampaignPhase> {
        self.phases
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CampaignConfigError::UnknownPhase(id.to_string()))
    }

    /// Resolve a tool script path against `tools.scripts_dir`.
    pub fn resolve_script(&self, tool: &ToolConfiguration) -> PathBuf {
        if tool.script_path.is_absolute() {
            tool.script_path.clone()
        } else {
            self.tools.scripts_dir.join(&tool.script_path)
        }
    }
}

/// One ordered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPhase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tools: Vec<ToolConfiguration>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    /// Checkpoint ids recorded by earlier runs of this phase.
    #[serde(default)]
    pub safety_checkpoints: Vec<String>,
}

/// A fix script invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfiguration {
    pub script_path: PathBuf,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub safety_level: SafetyLevel,
}

fn default_batch_size() -> u32 {
    25
}

impl ToolConfiguration {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            parameters: BTreeMap::new(),
            batch_size: default_batch_size(),
            safety_level: SafetyLevel::default(),
        }
    }

    /// Display name used in logs and events.
    pub fn name(&self) -> String {
        self.script_path
            .file_name()
            .map_or_else(
                || self.script_path.display().to_string(),
                |n| n.to_string_lossy().to_string(),
            )
    }
}

/// Machine-checkable completion thresholds. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessCriteria {
    pub typescript_errors: Option<u32>,
    pub linting_warnings: Option<u32>,
    /// Seconds; exceeding it is a warning, not an error.
    pub build_time: Option<f64>,
    pub enterprise_systems: Option<u32>,
    /// Name of a validator registered on the orchestrator.
    pub custom_validation: Option<String>,
}

impl SuccessCriteria {
    pub fn is_empty(&self) -> bool {
        self.typescript_errors.is_none()
            && self.linting_warnings.is_none()
            && self.build_time.is_none()
            && self.enterprise_systems.is_none()
            && self.custom_validation.is_none()
    }
}

/// Safety behaviour for the whole campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub max_files_per_batch: u32,
    pub build_validation_frequency: u32,
    pub test_validation_frequency: u32,
    pub corruption_detection_enabled: bool,
    pub automatic_rollback_enabled: bool,
    pub stash_retention_days: u32,
    pub real_time_monitoring: bool,
    pub monitoring_interval_ms: u64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            max_files_per_batch: 25,
            build_validation_frequency: 5,
            test_validation_frequency: 10,
            corruption_detection_enabled: true,
            automatic_rollback_enabled: true,
            stash_retention_days: 7,
            real_time_monitoring: false,
            monitoring_interval_ms: 30_000,
        }
    }
}

/// Campaign-wide quality targets used for achievements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressTargets {
    pub typescript_errors: u32,
    pub linting_warnings: u32,
    pub build_time: f64,
    pub enterprise_systems: u32,
}

impl Default for ProgressTargets {
    fn default() -> Self {
        Self {
            typescript_errors: 0,
            linting_warnings: 0,
            build_time: 10.0,
            enterprise_systems: 200,
        }
    }
}

/// Where tool scripts live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub scripts_dir: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAMPAIGN: &str = r#"
safety:
  automatic_rollback_enabled: false
  stash_retention_days: 3
targets:
  build_time: 8.0
tools:
  scripts_dir: tools
phases:
  - id: phase1
    name: Syntax cleanup
    tools:
      - script_path: fix-syntax.sh
        batch_size: 10
        safety_level: HIGH
        parameters:
          dry_run: false
    success_criteria:
      typescript_errors: 0
  - id: phase2
    name: Lint cleanup
    tools:
      - script_path: /opt/fix-lint.sh
    success_criteria:
      linting_warnings: 100
      build_time: 10.0
"#;

    #[test]
    fn parses_full_campaign() {
        let config = CampaignConfig::from_yaml(CAMPAIGN).unwrap();
        assert_eq!(config.phases.len(), 2);
        assert!(!config.safety.automatic_rollback_enabled);
        assert_eq!(config.safety.stash_retention_days, 3);
        assert_eq!(config.safety.max_files_per_batch, 25);
        assert!((config.targets.build_time - 8.0).abs() < f64::EPSILON);

        let phase1 = config.phase("phase1").unwrap();
        assert_eq!(phase1.tools[0].batch_size, 10);
        assert_eq!(phase1.tools[0].safety_level, SafetyLevel::High);
        assert_eq!(phase1.success_criteria.typescript_errors, Some(0));

        let phase2 = config.phase("phase2").unwrap();
        assert_eq!(phase2.tools[0].batch_size, 25);
        assert_eq!(phase2.tools[0].safety_level, SafetyLevel::Medium);
    }

    #[test]
    fn resolves_scripts_against_scripts_dir() {
        let config = CampaignConfig::from_yaml(CAMPAIGN).unwrap();
        let phase1 = config.phase("phase1").unwrap();
        let phase2 = config.phase("phase2").unwrap();
        assert_eq!(
            config.resolve_script(&phase1.tools[0]),
            PathBuf::from("tools/fix-syntax.sh")
        );
        assert_eq!(
            config.resolve_script(&phase2.tools[0]),
            PathBuf::from("/opt/fix-lint.sh")
        );
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let config = CampaignConfig::from_yaml(CAMPAIGN).unwrap();
        assert!(matches!(
            config.phase("phase9"),
            Err(CampaignConfigError::UnknownPhase(id)) if id == "phase9"
        ));
    }

    #[test]
    fn rejects_empty_campaign() {
        assert!(matches!(
            CampaignConfig::from_yaml("phases: []"),
            Err(CampaignConfigError::NoPhases)
        ));
    }

    #[test]
    fn rejects_duplicate_phase_ids() {
        let yaml = r#"
phases:
  - id: a
    name: A
    tools: [{ script_path: x.sh }]
    success_criteria: { typescript_errors: 0 }
  - id: a
    name: A again
    tools: [{ script_path: y.sh }]
    success_criteria: { typescript_errors: 0 }
"#;
        assert!(matches!(
            CampaignConfig::from_yaml(yaml),
            Err(CampaignConfigError::DuplicatePhase(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_phase_without_criteria() {
        let yaml = r#"
phases:
  - id: a
    name: A
    tools: [{ script_path: x.sh }]
"#;
        assert!(matches!(
            CampaignConfig::from_yaml(yaml),
            Err(CampaignConfigError::MissingCriteria(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_phase_without_tools() {
        let yaml = r#"
phases:
  - id: a
    name: A
    tools: []
    success_criteria: { custom_validation: smoke }
"#;
        assert!(matches!(
            CampaignConfig::from_yaml(yaml),
            Err(CampaignConfigError::NoTools(_))
        ));
    }

    #[test]
    fn tool_name_is_file_name() {
        assert_eq!(ToolConfiguration::new("scripts/fix.sh").name(), "fix.sh");
    }
}

//! Runtime configuration for the campaign daemon.
//!
//! Plain key=value format read from `.campaign/config`.
//! Precedence: CLI flags > `--config` file > `.campaign/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Commands, timeouts, supervision limits and state locations.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Locations (relative paths resolve against the workspace root)
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// Files or directories holding persisted metrics; cleared by nuclear reset.
    pub metrics_paths: Vec<PathBuf>,
    /// Campaign bookkeeping removed by nuclear reset.
    pub infrastructure_paths: Vec<PathBuf>,
    /// File extensions the corruption re-scan and import/export scan look at.
    pub source_extensions: Vec<String>,

    // External commands
    pub build_cmd: String,
    pub test_cmd: String,
    pub typecheck_cmd: String,
    pub metrics_cmd: Option<String>,

    // Timeouts
    pub git_timeout_sec: u32,
    pub build_timeout_sec: u32,
    pub test_timeout_sec: u32,
    pub typecheck_timeout_sec: u32,
    pub tool_timeout_sec: u32,

    // Process supervision
    pub heartbeat_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub infinite_loop_threshold_sec: u64,
    /// Per-process memory ceiling in megabytes (0 = unlimited).
    pub max_memory_mb: u64,
    /// Substrings used by emergency stop to find stray tool processes.
    pub tool_process_patterns: Vec<String>,

    /// Append safety events to `<state_dir>/safety-events.jsonl`.
    pub persist_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".campaign"),
            backup_dir: PathBuf::from(".campaign/backups"),
            metrics_paths: vec![PathBuf::from(".campaign/metrics")],
            infrastructure_paths: vec![
                PathBuf::from(".campaign/state"),
                PathBuf::from(".campaign/phase-report.tsv"),
            ],
            source_extensions: ["ts", "tsx", "js", "jsx"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            build_cmd: "yarn build".to_string(),
            test_cmd: "yarn test".to_string(),
            typecheck_cmd: "npx tsc --noEmit --skipLibCheck".to_string(),
            metrics_cmd: None,
            git_timeout_sec: 30,
            build_timeout_sec: 30,
            test_timeout_sec: 60,
            typecheck_timeout_sec: 120,
            tool_timeout_sec: 600,
            heartbeat_interval_ms: 5000,
            kill_grace_ms: 5000,
            infinite_loop_threshold_sec: 300,
            max_memory_mb: 0,
            tool_process_patterns: ["tsc", "eslint", "campaign-tool"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            persist_events: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "state_dir" => self.state_dir = PathBuf::from(value),
            "backup_dir" => self.backup_dir = PathBuf::from(value),
            "metrics_paths" => {
                self.metrics_paths = value.split_whitespace().map(PathBuf::from).collect();
            }
            "infrastructure_paths" => {
                self.infrastructure_paths = value.split_whitespace().map(PathBuf::from).collect();
            }
            "source_extensions" => {
                self.source_extensions = value
                    .split_whitespace()
                    .map(|ext| ext.trim_start_matches('.').to_string())
                    .collect();
            }
            "build_cmd" => self.build_cmd = value.to_string(),
            "test_cmd" => self.test_cmd = value.to_string(),
            "typecheck_cmd" => self.typecheck_cmd = value.to_string(),
            "metrics_cmd" => {
                self.metrics_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "git_timeout_sec" => self.git_timeout_sec = Self::parse_int(key, value)?,
            "build_timeout_sec" => self.build_timeout_sec = Self::parse_int(key, value)?,
            "test_timeout_sec" => self.test_timeout_sec = Self::parse_int(key, value)?,
            "typecheck_timeout_sec" => self.typecheck_timeout_sec = Self::parse_int(key, value)?,
            "tool_timeout_sec" => self.tool_timeout_sec = Self::parse_int(key, value)?,
            "heartbeat_interval_ms" => self.heartbeat_interval_ms = Self::parse_int(key, value)?,
            "kill_grace_ms" => self.kill_grace_ms = Self::parse_int(key, value)?,
            "infinite_loop_threshold_sec" => {
                self.infinite_loop_threshold_sec = Self::parse_int(key, value)?;
            }
            "max_memory_mb" => self.max_memory_mb = Self::parse_int(key, value)?,
            "tool_process_patterns" => {
                self.tool_process_patterns =
                    value.split_whitespace().map(ToString::to_string).collect();
            }
            "persist_events" => self.persist_events = Self::parse_bool(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_relative() {
                workspace_root.join(p)
            } else {
                p.clone()
            }
        };
        self.state_dir = resolve(&self.state_dir);
        self.backup_dir = resolve(&self.backup_dir);
        self.metrics_paths = self.metrics_paths.iter().map(resolve).collect();
        self.infrastructure_paths = self.infrastructure_paths.iter().map(resolve).collect();
    }

    /// True when `path` has one of the configured source extensions.
    pub fn is_source_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.source_extensions.iter().any(|s| s == ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.state_dir, PathBuf::from(".campaign"));
        assert_eq!(config.build_timeout_sec, 30);
        assert_eq!(config.test_timeout_sec, 60);
        assert_eq!(config.heartbeat_interval_ms, 5000);
        assert_eq!(config.kill_grace_ms, 5000);
        assert_eq!(config.infinite_loop_threshold_sec, 300);
        assert!(config.metrics_cmd.is_none());
        assert!(config.persist_events);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# commands
build_cmd="cargo build"
test_cmd='cargo test'
build_timeout_sec=45
persist_events=off
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.build_cmd, "cargo build");
        assert_eq!(config.test_cmd, "cargo test");
        assert_eq!(config.build_timeout_sec, 45);
        assert!(!config.persist_events);
    }

    #[test]
    fn parse_lists() {
        let mut config = Config::default();
        let content = r#"
metrics_paths=".campaign/metrics metrics.json"
source_extensions=".ts .rs"
tool_process_patterns=tsc eslint
"#;
        config.parse_content(content).unwrap();
        assert_eq!(
            config.metrics_paths,
            vec![PathBuf::from(".campaign/metrics"), PathBuf::from("metrics.json")]
        );
        assert_eq!(config.source_extensions, vec!["ts", "rs"]);
        assert_eq!(config.tool_process_patterns, vec!["tsc", "eslint"]);
    }

    #[test]
    fn empty_metrics_cmd_clears_it() {
        let mut config = Config::default();
        config.parse_content("metrics_cmd=./metrics.sh").unwrap();
        assert_eq!(config.metrics_cmd.as_deref(), Some("./metrics.sh"));
        config.parse_content("metrics_cmd=").unwrap();
        assert!(config.metrics_cmd.is_none());
    }

    #[test]
    fn invalid_int_reports_key() {
        let mut config = Config::default();
        let err = config.parse_content("kill_grace_ms=soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { ref key, .. } if key == "kill_grace_ms"));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("build_cmd"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "Y").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn resolve_paths_joins_relative_only() {
        let mut config = Config {
            backup_dir: PathBuf::from("/var/backups/campaign"),
            ..Config::default()
        };
        config.resolve_paths(Path::new("/repo"));
        assert_eq!(config.state_dir, PathBuf::from("/repo/.campaign"));
        assert_eq!(config.backup_dir, PathBuf::from("/var/backups/campaign"));
        assert_eq!(
            config.metrics_paths,
            vec![PathBuf::from("/repo/.campaign/metrics")]
        );
    }

    #[test]
    fn source_file_detection_uses_extensions() {
        let config = Config::default();
        assert!(config.is_source_file(Path::new("src/app.tsx")));
        assert!(!config.is_source_file(Path::new("README.md")));
        assert!(!config.is_source_file(Path::new("Makefile")));
    }
}

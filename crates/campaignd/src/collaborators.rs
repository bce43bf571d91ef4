//! External collaborators the orchestrator depends on.
//!
//! Tool execution and metrics collection sit behind traits so the
//! orchestrator can be driven by fakes in tests. The command-backed defaults
//! run under the process supervisor and read a JSON summary from the last
//! JSON line the command prints.

use crate::supervisor::{CommandSpec, ResourceLimits, Supervisor, SupervisorError};
use crate::verifier::Verifier;
use async_trait::async_trait;
use campaign_core::campaign::ToolConfiguration;
use campaign_core::ProgressMetrics;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("tool {tool} exited with {exit_code}: {stderr}")]
    Failed {
        tool: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("tool {0} not found")]
    MissingScript(PathBuf),
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("metrics command exited with {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },
    #[error("metrics command printed no JSON summary")]
    NoSummary,
    #[error("no metrics command configured (set metrics_cmd)")]
    NotConfigured,
}

/// What one tool run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolOutcome {
    pub files_processed: Vec<PathBuf>,
    pub changes_applied: u32,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool: &ToolConfiguration) -> Result<ToolOutcome, ToolError>;
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn current(&self) -> Result<ProgressMetrics, MetricsError>;
}

/// Build and test checks run between tools. `Err` carries a failure summary.
#[async_trait]
pub trait ProjectChecks: Send + Sync {
    async fn build(&self) -> Result<(), String>;
    async fn tests(&self) -> Result<(), String>;
}

#[async_trait]
impl ProjectChecks for Verifier {
    async fn build(&self) -> Result<(), String> {
        match self.run_build().await {
            Ok(check) if check.passed => Ok(()),
            Ok(check) => Err(check.failure_summary()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn tests(&self) -> Result<(), String> {
        match self.run_tests().await {
            Ok(check) if check.passed => Ok(()),
            Ok(check) => Err(check.failure_summary()),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Runs a tool script with its parameters as command-line flags.
///
/// `.js`/`.cjs`/`.mjs` scripts run under `node`; anything else is executed
/// directly. Flags are `--batch-size=<n>` followed by `--<key>=<value>` per
/// parameter (`true` becomes a bare `--<key>`, `false` and `null` are omitted).
#[derive(Debug, Clone)]
pub struct ScriptToolExecutor {
    supervisor: Supervisor,
    scripts_dir: PathBuf,
    working_dir: PathBuf,
    limits: ResourceLimits,
}

impl ScriptToolExecutor {
    pub fn new(
        supervisor: Supervisor,
        scripts_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            supervisor,
            scripts_dir: scripts_dir.into(),
            working_dir: working_dir.into(),
            limits,
        }
    }

    fn script_path(&self, tool: &ToolConfiguration) -> PathBuf {
        if tool.script_path.is_absolute() {
            tool.script_path.clone()
        } else {
            self.scripts_dir.join(&tool.script_path)
        }
    }

    fn command(&self, script: &Path, tool: &ToolConfiguration) -> CommandSpec {
        let is_node = script
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "js" | "cjs" | "mjs"));
        let spec = if is_node {
            CommandSpec::new("node").arg(script.to_string_lossy())
        } else {
            CommandSpec::new(script.to_string_lossy())
        };
        spec.args(tool_flags(tool)).current_dir(&self.working_dir)
    }
}

#[async_trait]
impl ToolExecutor for ScriptToolExecutor {
    async fn execute(&self, tool: &ToolConfiguration) -> Result<ToolOutcome, ToolError> {
        let script = self.script_path(tool);
        if !script.exists() {
            return Err(ToolError::MissingScript(script));
        }

        let spec = self.command(&script, tool);
        info!(tool = %tool.name(), command = %spec.display(), "running tool");
        let output = self.supervisor.run(&spec, self.limits).await?;

        if !output.success() {
            return Err(ToolError::Failed {
                tool: tool.name(),
                exit_code: output.exit_code,
                stderr: tail(&output.stderr, STDERR_TAIL_LINES),
            });
        }

        let outcome = last_json_line::<ToolOutcome>(&output.stdout).unwrap_or_else(|| {
            warn!(tool = %tool.name(), "tool printed no JSON summary; assuming no changes");
            ToolOutcome::default()
        });
        debug!(
            tool = %tool.name(),
            files = outcome.files_processed.len(),
            changes = outcome.changes_applied,
            duration_ms = output.duration_ms,
            "tool finished"
        );
        Ok(outcome)
    }
}

/// Runs a shell command that prints `ProgressMetrics` as JSON.
#[derive(Debug, Clone)]
pub struct CommandMetricsSource {
    supervisor: Supervisor,
    cmd: String,
    working_dir: PathBuf,
    limits: ResourceLimits,
}

impl CommandMetricsSource {
    pub fn new(
        supervisor: Supervisor,
        cmd: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            supervisor,
            cmd: cmd.into(),
            working_dir: working_dir.into(),
            limits,
        }
    }
}

#[async_trait]
impl MetricsSource for CommandMetricsSource {
    async fn current(&self) -> Result<ProgressMetrics, MetricsError> {
        let spec = CommandSpec::shell(&self.cmd).current_dir(&self.working_dir);
        let output = self.supervisor.run(&spec, self.limits).await?;
        if !output.success() {
            return Err(MetricsError::Failed {
                exit_code: output.exit_code,
                stderr: tail(&output.stderr, STDERR_TAIL_LINES),
            });
        }
        last_json_line(&output.stdout).ok_or(MetricsError::NoSummary)
    }
}

/// Stands in when no metrics command is configured; every read fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredMetrics;

#[async_trait]
impl MetricsSource for UnconfiguredMetrics {
    async fn current(&self) -> Result<ProgressMetrics, MetricsError> {
        Err(MetricsError::NotConfigured)
    }
}

fn tool_flags(tool: &ToolConfiguration) -> Vec<String> {
    let mut flags = vec![format!("--batch-size={}", tool.batch_size)];
    for (key, value) in &tool.parameters {
        match value {
            serde_json::Value::Bool(true) => flags.push(format!("--{key}")),
            serde_json::Value::Bool(false) | serde_json::Value::Null => {}
            serde_json::Value::String(s) => flags.push(format!("--{key}={s}")),
            other => flags.push(format!("--{key}={other}")),
        }
    }
    flags
}

/// Last stdout line that parses as `T`.
fn last_json_line<T: DeserializeOwned>(stdout: &str) -> Option<T> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

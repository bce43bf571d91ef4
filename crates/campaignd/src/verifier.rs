//! Build and test checks.
//!
//! Runs the configured build and test commands under the process supervisor
//! with their own timeouts. A non-zero exit is a failed check, not an error;
//! a timeout or spawn failure is an error.

use crate::supervisor::{CommandSpec, ResourceLimits, Supervisor, SupervisorError};
use campaign_core::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Output lines kept in a failure summary.
const FAILURE_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("no {0} command configured")]
    NoCommand(&'static str),
}

pub type Result<T> = std::result::Result<T, VerifierError>;

/// Outcome of one check command.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub cmd: String,
    pub exit_code: i32,
    pub passed: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl CheckResult {
    /// Last lines of combined output, headed by the command and exit code.
    pub fn failure_summary(&self) -> String {
        let combined = if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n--- STDERR ---\n{}", self.stdout, self.stderr)
        };

        let lines: Vec<&str> = combined.lines().collect();
        let tail_start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
        let mut summary = format!("--- FAILED: {} (exit {}) ---\n", self.cmd, self.exit_code);
        for line in &lines[tail_start..] {
            summary.push_str(line);
            summary.push('\n');
        }
        summary
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    pub build_cmd: String,
    pub test_cmd: String,
    /// Seconds; 0 disables the timeout.
    pub build_timeout_sec: u32,
    pub test_timeout_sec: u32,
}

impl VerifierConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_cmd: config.build_cmd.clone(),
            test_cmd: config.test_cmd.clone(),
            build_timeout_sec: config.build_timeout_sec,
            test_timeout_sec: config.test_timeout_sec,
        }
    }
}

/// Runs build and test commands in one work tree.
#[derive(Debug, Clone)]
pub struct Verifier {
    supervisor: Supervisor,
    config: VerifierConfig,
    working_dir: PathBuf,
}

impl Verifier {
    pub fn new(supervisor: Supervisor, config: VerifierConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            supervisor,
            config,
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run_build(&self) -> Result<CheckResult> {
        self.check("build", &self.config.build_cmd, self.config.build_timeout_sec)
            .await
    }

    pub async fn run_tests(&self) -> Result<CheckResult> {
        self.check("test", &self.config.test_cmd, self.config.test_timeout_sec)
            .await
    }

    async fn check(&self, kind: &'static str, cmd: &str, timeout_sec: u32) -> Result<CheckResult> {
        if cmd.trim().is_empty() {
            return Err(VerifierError::NoCommand(kind));
        }
        debug!(kind, cmd = %cmd, timeout_sec, "running check");

        let spec = CommandSpec::shell(cmd).current_dir(&self.working_dir);
        let output = self
            .supervisor
            .run(&spec, ResourceLimits::timeout_secs(timeout_sec))
            .await?;

        let passed = output.success();
        if passed {
            info!(kind, duration_ms = output.duration_ms, "check passed");
        } else {
            warn!(
                kind,
                exit_code = output.exit_code,
                duration_ms = output.duration_ms,
                "check failed"
            );
        }

        Ok(CheckResult {
            cmd: cmd.to_string(),
            exit_code: output.exit_code,
            passed,
            duration_ms: output.duration_ms,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

//! campaignd - codebase campaign orchestrator
//!
//! Runs configured phases of automated fix tools over a git work tree with
//! checkpoints, corruption detection, rollback and process supervision.

pub mod collaborators;
pub mod corruption;
pub mod git;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod safety;
pub mod stash_store;
pub mod supervisor;
pub mod verifier;

use campaign_core::campaign::{CampaignConfig, CampaignConfigError};
use campaign_core::config::ConfigError;
use campaign_core::{Config, ReportWriter};
use collaborators::{
    CommandMetricsSource, MetricsSource, ScriptToolExecutor, ToolExecutor, UnconfiguredMetrics,
};
use orchestrator::{OrchestratorError, PhaseOrchestrator, PhaseOutcome};
use recovery::EmergencyRecovery;
use safety::{SafetyError, SafetyProtocol};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use supervisor::{ResourceLimits, Supervisor, SupervisorConfig};
use thiserror::Error;
use tracing::{info, warn};
use verifier::{Verifier, VerifierConfig};

/// Project config file, relative to the workspace root.
pub const PROJECT_CONFIG: &str = ".campaign/config";
/// Phase ledger file name inside the state directory.
pub const PHASE_REPORT: &str = "phase-report.tsv";

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("{path}: {source}")]
    Config { path: PathBuf, source: ConfigError },
    #[error("config override not found: {0}")]
    ConfigNotFound(PathBuf),
    #[error(transparent)]
    Campaign(#[from] CampaignConfigError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CampaignError>;

/// User-level config (~/.config/campaign/config).
pub fn user_config_path() -> PathBuf {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
    config_dir.join("campaign").join("config")
}

/// Load the user config, then `.campaign/config`, then the override (each
/// when present), then resolve relative paths against `workspace_root`.
pub fn load_workspace_config(workspace_root: &Path, config_override: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    let user_config = user_config_path();
    if user_config.exists() {
        config
            .load_file(&user_config)
            .map_err(|source| CampaignError::Config {
                path: user_config.clone(),
                source,
            })?;
    }

    let project_config = workspace_root.join(PROJECT_CONFIG);
    if project_config.exists() {
        config
            .load_file(&project_config)
            .map_err(|source| CampaignError::Config {
                path: project_config.clone(),
                source,
            })?;
    }

    if let Some(path) = config_override {
        if !path.exists() {
            return Err(CampaignError::ConfigNotFound(path.to_path_buf()));
        }
        config.load_file(path).map_err(|source| CampaignError::Config {
            path: path.to_path_buf(),
            source,
        })?;
    }

    config.resolve_paths(workspace_root);
    Ok(config)
}

/// Phases run in order; the first phase that does not succeed stops the run.
#[derive(Debug, Clone, Default)]
pub struct CampaignSummary {
    pub outcomes: Vec<PhaseOutcome>,
    pub completed: bool,
}

/// Everything wired together for one workspace.
#[derive(Debug)]
pub struct Campaign {
    root: PathBuf,
    campaign: CampaignConfig,
    supervisor: Supervisor,
    safety: Arc<SafetyProtocol>,
    recovery: EmergencyRecovery,
    orchestrator: PhaseOrchestrator,
}

impl Campaign {
    /// Wire the command-backed collaborators. Must run inside a tokio runtime.
    pub fn open(root: impl Into<PathBuf>, config: Config, campaign: CampaignConfig) -> Result<Self> {
        let root = root.into();
        let supervisor = Supervisor::start(SupervisorConfig::from_config(&config));
        let limits = ResourceLimits::timeout_secs(config.tool_timeout_sec)
            .with_max_memory_mb(config.max_memory_mb);

        let scripts_dir = if campaign.tools.scripts_dir.is_absolute() {
            campaign.tools.scripts_dir.clone()
        } else {
            root.join(&campaign.tools.scripts_dir)
        };
        let tools: Arc<dyn ToolExecutor> = Arc::new(ScriptToolExecutor::new(
            supervisor.clone(),
            scripts_dir,
            root.clone(),
            limits,
        ));
        let metrics: Arc<dyn MetricsSource> = match &config.metrics_cmd {
            Some(cmd) => Arc::new(CommandMetricsSource::new(
                supervisor.clone(),
                cmd.clone(),
                root.clone(),
                ResourceLimits::timeout_secs(config.tool_timeout_sec),
            )),
            None => Arc::new(UnconfiguredMetrics),
        };

        Self::with_collaborators(root, config, campaign, supervisor, tools, metrics)
    }

    /// Wire with caller-supplied collaborators.
    pub fn with_collaborators(
        root: impl Into<PathBuf>,
        config: Config,
        campaign: CampaignConfig,
        supervisor: Supervisor,
        tools: Arc<dyn ToolExecutor>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Result<Self> {
        let root = root.into();
        stash_store::ensure_ignored_dir(&config.state_dir).map_err(SafetyError::from)?;
        let report = ReportWriter::new(&config.state_dir.join(PHASE_REPORT))?;
        let verifier = Verifier::new(
            supervisor.clone(),
            VerifierConfig::from_config(&config),
            root.clone(),
        );

        let safety = Arc::new(SafetyProtocol::open(
            supervisor.clone(),
            root.clone(),
            config,
            campaign.safety.clone(),
        )?);
        let recovery = EmergencyRecovery::new(Arc::clone(&safety));
        let orchestrator = PhaseOrchestrator::new(
            Arc::clone(&safety) as Arc<dyn orchestrator::SafetyNet>,
            tools,
            metrics,
            campaign.safety.clone(),
            campaign.targets.clone(),
        )
        .with_checks(Arc::new(verifier))
        .with_report_writer(report);

        Ok(Self {
            root,
            campaign,
            supervisor,
            safety,
            recovery,
            orchestrator,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn campaign(&self) -> &CampaignConfig {
        &self.campaign
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn safety(&self) -> &Arc<SafetyProtocol> {
        &self.safety
    }

    pub fn recovery(&self) -> &EmergencyRecovery {
        &self.recovery
    }

    pub fn orchestrator(&self) -> &PhaseOrchestrator {
        &self.orchestrator
    }

    pub async fn run_phase(&self, phase_id: &str) -> Result<PhaseOutcome> {
        let phase = self.campaign.phase(phase_id)?;
        Ok(self.orchestrator.execute_phase(phase).await?)
    }

    /// Run every phase in order, stopping at the first that does not succeed.
    pub async fn run_all(&self) -> Result<CampaignSummary> {
        let settings = &self.campaign.safety;
        if settings.real_time_monitoring {
            match self.safety.source_files().await {
                Ok(files) => {
                    self.safety
                        .start_real_time_monitoring(
                            files,
                            Duration::from_millis(settings.monitoring_interval_ms),
                        )
                        .await;
                }
                Err(err) => warn!(error = %err, "real-time monitoring not started"),
            }
        }

        let result = self.run_phases().await;

        if settings.real_time_monitoring {
            self.safety.stop_real_time_monitoring().await;
        }
        result
    }

    async fn run_phases(&self) -> Result<CampaignSummary> {
        let mut summary = CampaignSummary::default();
        for phase in &self.campaign.phases {
            let outcome = self.orchestrator.execute_phase(phase).await?;
            let succeeded = outcome.is_success();
            summary.outcomes.push(outcome);
            if !succeeded {
                warn!(phase_id = %phase.id, "phase did not succeed; stopping campaign");
                return Ok(summary);
            }
        }
        summary.completed = true;
        info!(phases = summary.outcomes.len(), "campaign complete");
        Ok(summary)
    }

    /// Stop background monitoring and the supervisor; kills tracked children.
    pub async fn shutdown(&self) {
        self.safety.stop_real_time_monitoring().await;
        self.supervisor.shutdown().await;
    }
}

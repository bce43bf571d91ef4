//! campaignd - codebase campaign orchestrator
//!
//! Command-line entry point.

mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use campaign_core::campaign::CampaignConfig;
use campaignd::recovery::{NuclearResetOptions, RecoveryOptions};
use campaignd::supervisor::{Supervisor, SupervisorConfig};
use campaignd::{load_workspace_config, Campaign};
use clap::{Parser, Subcommand};
use eyre::{bail, eyre, WrapErr};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Default campaign definition, relative to the workspace root.
const DEFAULT_CAMPAIGN: &str = ".campaign/campaign.yaml";

#[derive(Parser)]
#[command(name = "campaignd", about = "Codebase campaign orchestrator", version)]
struct Cli {
    /// Workspace root (default: git top-level, else current directory)
    #[arg(long, global = true, env = "CAMPAIGN_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Config file path (overrides .campaign/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Campaign definition (default: .campaign/campaign.yaml)
    #[arg(long, global = true, env = "CAMPAIGN_FILE")]
    campaign: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every phase in order, or a single phase
    Run {
        #[arg(long)]
        phase: Option<String>,
    },
    /// Check current metrics against a phase's success criteria
    Validate {
        #[arg(long)]
        phase: String,
    },
    /// Print a phase report
    Report {
        #[arg(long)]
        phase: String,
        /// Emit JSON instead of markdown
        #[arg(long)]
        json: bool,
    },
    /// Take a checkpoint of the work tree
    Checkpoint {
        description: String,
        #[arg(long)]
        phase: Option<String>,
    },
    /// Inspect and clean up checkpoints
    Stashes {
        #[command(subcommand)]
        command: StashCommand,
    },
    /// Restore a checkpoint (latest when no selector is given)
    Rollback {
        #[arg(long, conflicts_with = "phase")]
        stash: Option<String>,
        /// Latest checkpoint of this phase
        #[arg(long)]
        phase: Option<String>,
    },
    /// Scan files for corruption (default: all tracked source files)
    Scan {
        files: Vec<PathBuf>,
        /// Only check import/export syntax
        #[arg(long)]
        import_export: bool,
        /// Also run the type checker for syntax errors
        #[arg(long)]
        typescript: bool,
    },
    /// Recovery operations
    Recover {
        #[command(subcommand)]
        command: RecoverCommand,
    },
    /// Kill every supervised and stray tool process
    EmergencyStop,
}

#[derive(Subcommand)]
enum StashCommand {
    List,
    Stats,
    /// Drop checkpoints older than the retention window
    Cleanup,
}

#[derive(Subcommand)]
enum RecoverCommand {
    /// Roll back to the latest checkpoint
    Emergency {
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        no_validate: bool,
    },
    /// Hard-reset to a commit
    Commit {
        hash: String,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        no_validate: bool,
    },
    /// Archive, reset and clear all campaign state
    Nuclear {
        /// Commit to reset to (default: HEAD)
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        preserve_metrics: bool,
        #[arg(long)]
        preserve_stashes: bool,
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
    /// Restore only the given paths from a checkpoint
    Selective {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long)]
        stash: Option<String>,
    },
    /// Recovery counts from the persisted event journal
    Stats,
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let workspace = match cli.workspace.clone() {
        Some(path) => path,
        None => find_workspace_root(),
    };
    let config = match load_workspace_config(&workspace, cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return failure(&eyre!(err)),
    };

    if matches!(cli.command, Command::EmergencyStop) {
        let supervisor = Supervisor::start(SupervisorConfig::from_config(&config));
        let report = supervisor.emergency_stop().await;
        supervisor.shutdown().await;
        render::print_emergency_stop(&report);
        return 0;
    }

    let campaign_path = cli
        .campaign
        .clone()
        .map(|p| if p.is_absolute() { p } else { workspace.join(p) })
        .unwrap_or_else(|| workspace.join(DEFAULT_CAMPAIGN));
    let needs_phases = matches!(
        cli.command,
        Command::Run { .. } | Command::Validate { .. } | Command::Report { .. }
    );
    let campaign_config = match load_campaign(&campaign_path, needs_phases) {
        Ok(campaign) => campaign,
        Err(err) => return failure(&err),
    };

    let campaign = match Campaign::open(&workspace, config, campaign_config) {
        Ok(campaign) => campaign,
        Err(err) => return failure(&eyre!(err)),
    };

    let result = with_signals(&campaign, execute(&campaign, cli.command)).await;
    render::print_critical_events(&campaign.safety().events());
    campaign.shutdown().await;

    match result {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => failure(&err),
    }
}

/// Run `fut`, emergency-stopping on SIGINT/SIGTERM.
async fn with_signals<F>(campaign: &Campaign, fut: F) -> eyre::Result<bool>
where
    F: std::future::Future<Output = eyre::Result<bool>>,
{
    tokio::select! {
        result = fut => result,
        signal = shutdown_signal() => {
            let signal = signal?;
            warn!(signal, "received shutdown signal, stopping all tool processes");
            interrupted(campaign).await
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> eyre::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> eyre::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    Ok("SIGINT")
}

async fn interrupted(campaign: &Campaign) -> eyre::Result<bool> {
    let report = campaign.supervisor().emergency_stop().await;
    render::print_emergency_stop(&report);
    bail!("interrupted")
}

fn failure(err: &eyre::Report) -> i32 {
    error!(error = %err, "command failed");
    eprintln!();
    eprintln!("==================== CAMPAIGN FAILURE ====================");
    eprintln!("{err:#}");
    eprintln!("==========================================================");
    1
}

fn load_campaign(path: &Path, required: bool) -> eyre::Result<CampaignConfig> {
    if path.exists() {
        return CampaignConfig::from_file(path)
            .wrap_err_with(|| format!("invalid campaign file {}", path.display()));
    }
    if required {
        bail!("campaign file not found: {}", path.display());
    }
    Ok(CampaignConfig::default())
}

/// Returns whether the command succeeded; `false` exits 1 without a banner.
async fn execute(campaign: &Campaign, command: Command) -> eyre::Result<bool> {
    let safety = campaign.safety();
    let recovery = campaign.recovery();

    match command {
        Command::Run { phase: Some(id) } => {
            let outcome = campaign.run_phase(&id).await?;
            render::print_phase_outcome(&id, &outcome);
            Ok(outcome.is_success())
        }
        Command::Run { phase: None } => {
            let summary = campaign.run_all().await?;
            for (phase, outcome) in campaign.campaign().phases.iter().zip(&summary.outcomes) {
                render::print_phase_outcome(&phase.id, outcome);
            }
            Ok(summary.completed)
        }
        Command::Validate { phase } => {
            let phase = campaign.campaign().phase(&phase)?;
            let validation = campaign
                .orchestrator()
                .validate_phase_completion(phase)
                .await?;
            render::print_validation(&phase.id, &validation);
            Ok(validation.success)
        }
        Command::Report { phase, json } => {
            let phase = campaign.campaign().phase(&phase)?;
            let report = campaign.orchestrator().generate_phase_report(phase).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                render::print_report(&report);
            }
            Ok(true)
        }
        Command::Checkpoint { description, phase } => {
            let stash = safety.create_stash(&description, phase.as_deref()).await?;
            render::print_stash_created(&stash);
            Ok(true)
        }
        Command::Stashes { command } => match command {
            StashCommand::List => {
                render::print_stash_list(&safety.list_stashes().await);
                Ok(true)
            }
            StashCommand::Stats => {
                render::print_stash_stats(&safety.get_stash_statistics().await);
                Ok(true)
            }
            StashCommand::Cleanup => {
                let removed = safety.cleanup_old_stashes().await?;
                println!("Removed {removed} checkpoint(s).");
                Ok(true)
            }
        },
        Command::Rollback { stash, phase } => {
            let restored = match (stash, phase) {
                (Some(id), _) => {
                    let warnings = safety.apply_stash(&id, true).await?;
                    for warning in warnings {
                        println!("warning: {warning}");
                    }
                    id
                }
                (None, Some(phase)) => safety.apply_stash_by_phase(&phase).await?.id,
                (None, None) => safety.auto_apply_latest_stash().await?.id,
            };
            println!("Restored checkpoint: {restored}");
            Ok(true)
        }
        Command::Scan {
            files,
            import_export,
            typescript,
        } => {
            let files = if files.is_empty() {
                safety.source_files().await?
            } else {
                files
            };
            info!(files = files.len(), "scanning for corruption");
            let mut report = if import_export {
                safety.detect_import_export_corruption(&files)
            } else {
                safety.detect_corruption(&files)
            };
            if typescript {
                let syntax = safety.validate_syntax_with_typescript(&files).await?;
                report = campaignd::corruption::merge_reports(report, syntax);
            }
            render::print_corruption_report(&report);
            Ok(!report.has_corruption())
        }
        Command::Recover { command } => execute_recover(recovery, command).await,
        Command::EmergencyStop => {
            let report = campaign.supervisor().emergency_stop().await;
            render::print_emergency_stop(&report);
            Ok(true)
        }
    }
}

async fn execute_recover(
    recovery: &campaignd::recovery::EmergencyRecovery,
    command: RecoverCommand,
) -> eyre::Result<bool> {
    match command {
        RecoverCommand::Emergency {
            no_backup,
            no_validate,
        } => {
            let validation = recovery
                .emergency_rollback_with_options(RecoveryOptions {
                    create_backup: !no_backup,
                    validate_after: !no_validate,
                })
                .await?;
            render::print_recovery_validation(&validation);
            Ok(validation.success)
        }
        RecoverCommand::Commit {
            hash,
            no_backup,
            no_validate,
        } => {
            let validation = recovery
                .rollback_to_commit(
                    &hash,
                    RecoveryOptions {
                        create_backup: !no_backup,
                        validate_after: !no_validate,
                    },
                )
                .await?;
            render::print_recovery_validation(&validation);
            Ok(validation.success)
        }
        RecoverCommand::Nuclear {
            target,
            no_backup,
            preserve_metrics,
            preserve_stashes,
            yes,
        } => {
            if !yes {
                bail!("nuclear reset discards all uncommitted work; pass --yes to confirm");
            }
            let result = recovery
                .nuclear_reset(NuclearResetOptions {
                    create_backup: !no_backup,
                    target_commit: target,
                    preserve_metrics,
                    preserve_stashes,
                })
                .await;
            render::print_nuclear_result(&result);
            Ok(result.success)
        }
        RecoverCommand::Selective { paths, stash } => {
            let result = recovery.selective_recovery(&paths, stash.as_deref()).await;
            render::print_selective_result(&result);
            Ok(result.success)
        }
        RecoverCommand::Stats => {
            render::print_recovery_stats(&recovery.journal_statistics());
            Ok(true)
        }
    }
}

fn find_workspace_root() -> PathBuf {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            PathBuf::from(String::from_utf8_lossy(&out.stdout).trim())
        }
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

//! Whole campaigns with scripted tools over a real git repository.

mod common;

use async_trait::async_trait;
use campaign_core::campaign::{CampaignConfig, ToolConfiguration};
use campaign_core::ProgressMetrics;
use campaignd::collaborators::{MetricsError, MetricsSource, ToolError, ToolExecutor, ToolOutcome};
use campaignd::orchestrator::PhaseOutcome;
use campaignd::supervisor::{Supervisor, SupervisorConfig};
use campaignd::{Campaign, PHASE_REPORT};
use common::{TestRepo, APP_FILE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const CAMPAIGN: &str = r"
phases:
  - id: phase1
    name: Tidy exports
    tools:
      - script_path: tidy-exports.js
    success_criteria:
      typescript_errors: 0
  - id: phase2
    name: Rewrite imports
    tools:
      - script_path: rewrite-imports.js
    success_criteria:
      typescript_errors: 0
safety:
  build_validation_frequency: 1
  test_validation_frequency: 1
";

/// Writes fixed content to one file per script.
struct FileWriter {
    root: PathBuf,
    writes: HashMap<String, (&'static str, &'static str)>,
}

#[async_trait]
impl ToolExecutor for FileWriter {
    async fn execute(&self, tool: &ToolConfiguration) -> Result<ToolOutcome, ToolError> {
        let Some((rel, content)) = self.writes.get(&tool.name()) else {
            return Err(ToolError::MissingScript(tool.script_path.clone()));
        };
        let path = self.root.join(rel);
        std::fs::write(&path, content).unwrap();
        Ok(ToolOutcome {
            files_processed: vec![path],
            changes_applied: 1,
        })
    }
}

struct CleanMetrics;

#[async_trait]
impl MetricsSource for CleanMetrics {
    async fn current(&self) -> Result<ProgressMetrics, MetricsError> {
        Ok(ProgressMetrics::default())
    }
}

fn open(repo: &TestRepo, writes: &[(&str, &'static str, &'static str)]) -> Campaign {
    let config = repo.config();
    let supervisor = Supervisor::start(SupervisorConfig::from_config(&config));
    let tools = FileWriter {
        root: repo.path().to_path_buf(),
        writes: writes
            .iter()
            .map(|(script, rel, content)| ((*script).to_string(), (*rel, *content)))
            .collect(),
    };
    Campaign::with_collaborators(
        repo.path(),
        config,
        CampaignConfig::from_yaml(CAMPAIGN).unwrap(),
        supervisor,
        Arc::new(tools),
        Arc::new(CleanMetrics),
    )
    .unwrap()
}

#[tokio::test]
async fn clean_phases_complete_and_are_ledgered() {
    let repo = TestRepo::new();
    let campaign = open(
        &repo,
        &[
            ("tidy-exports.js", APP_FILE, "export const value = 2;\n"),
            ("rewrite-imports.js", APP_FILE, "export const value = 3;\n"),
        ],
    );

    let summary = campaign.run_all().await.unwrap();

    assert!(summary.completed);
    assert_eq!(summary.outcomes.len(), 2);
    assert!(summary.outcomes.iter().all(PhaseOutcome::is_success));
    assert_eq!(repo.read(APP_FILE), "export const value = 3;\n");

    // One pre-phase checkpoint per phase.
    assert_eq!(campaign.safety().list_stashes().await.len(), 2);

    let ledger = repo.read(&format!(".campaign/{PHASE_REPORT}"));
    assert!(ledger.contains("phase1"));
    assert!(ledger.contains("phase2"));

    campaign.shutdown().await;
}

#[tokio::test]
async fn corrupting_tool_rolls_phase_back_and_stops_campaign() {
    let repo = TestRepo::new();
    let campaign = open(
        &repo,
        &[
            ("tidy-exports.js", APP_FILE, "export const value = 2;\n"),
            (
                "rewrite-imports.js",
                APP_FILE,
                "<<<<<<< HEAD\nexport const value = 2;\n=======\nexport const value = 4;\n>>>>>>> tool\n",
            ),
        ],
    );

    let summary = campaign.run_all().await.unwrap();

    assert!(!summary.completed);
    assert_eq!(summary.outcomes.len(), 2);
    assert!(summary.outcomes[0].is_success());
    let PhaseOutcome::Aborted(abort) = &summary.outcomes[1] else {
        panic!("second phase should abort, got {:?}", summary.outcomes[1]);
    };
    assert_eq!(abort.phase_id, "phase2");
    assert!(abort.reason.contains("rewrite-imports.js"));

    // Back to where phase2 started: phase1's edit survives.
    assert_eq!(repo.read(APP_FILE), "export const value = 2;\n");
    assert!(campaign
        .safety()
        .events()
        .iter()
        .any(|e| e.action == "phase-rollback"));

    campaign.shutdown().await;
}

#[tokio::test]
async fn single_phase_runs_by_id() {
    let repo = TestRepo::new();
    let campaign = open(
        &repo,
        &[("rewrite-imports.js", APP_FILE, "export const value = 7;\n")],
    );

    let outcome = campaign.run_phase("phase2").await.unwrap();
    let PhaseOutcome::Completed(result) = outcome else {
        panic!("phase should complete");
    };
    assert!(result.success);
    assert_eq!(result.files_processed, 1);
    assert_eq!(result.errors_fixed, 0);

    assert!(campaign.run_phase("phase9").await.is_err());
    campaign.shutdown().await;
}

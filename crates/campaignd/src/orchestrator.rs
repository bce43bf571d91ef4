//! Phase orchestrator.
//!
//! Runs one phase at a time: checkpoint, metrics snapshot, then each tool in
//! order followed by a progress check. Tool `i + 1` never starts before the
//! check for tool `i` has finished. A failed check with automatic rollback
//! enabled restores the pre-phase checkpoint and ends the phase as
//! [`PhaseOutcome::Aborted`]; any other failure ends it as a failed
//! [`PhaseResult`].

use crate::collaborators::{MetricsError, MetricsSource, ProjectChecks, ToolError, ToolExecutor};
use crate::safety::{SafetyError, SafetyProtocol};
use async_trait::async_trait;
use campaign_core::campaign::{CampaignPhase, ProgressTargets, SafetySettings};
use campaign_core::{
    CorruptionReport, CorruptionSeverity, EventSeverity, GitStash, MetricsImprovement, PhaseReport,
    PhaseResult, PhaseStatus, ProgressMetrics, ReportRow, ReportWriter, SafetyEvent,
    SafetyEventType, ValidationResult,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
    #[error("phase {0} has no success criteria")]
    MissingCriteria(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("rollback of phase {phase_id} to {checkpoint_id} failed: {source}")]
    RollbackFailed {
        phase_id: String,
        checkpoint_id: String,
        source: SafetyError,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Safety operations the orchestrator needs.
#[async_trait]
pub trait SafetyNet: Send + Sync {
    async fn checkpoint(&self, description: &str, phase: Option<&str>) -> std::result::Result<GitStash, SafetyError>;
    async fn restore_checkpoint(&self, id: &str) -> std::result::Result<(), SafetyError>;
    /// Changes whenever a checkpoint is restored, by anyone.
    fn generation(&self) -> u64;
    fn scan(&self, files: &[PathBuf]) -> CorruptionReport;
    fn log_event(
        &self,
        event_type: SafetyEventType,
        severity: EventSeverity,
        description: String,
        action: &str,
    ) -> SafetyEvent;
}

#[async_trait]
impl SafetyNet for SafetyProtocol {
    async fn checkpoint(&self, description: &str, phase: Option<&str>) -> std::result::Result<GitStash, SafetyError> {
        self.create_stash(description, phase).await
    }

    async fn restore_checkpoint(&self, id: &str) -> std::result::Result<(), SafetyError> {
        self.apply_stash(id, true).await.map(|_| ())
    }

    fn generation(&self) -> u64 {
        self.rollback_generation()
    }

    fn scan(&self, files: &[PathBuf]) -> CorruptionReport {
        self.detect_corruption(files)
    }

    fn log_event(
        &self,
        event_type: SafetyEventType,
        severity: EventSeverity,
        description: String,
        action: &str,
    ) -> SafetyEvent {
        self.record(event_type, severity, description, action)
    }
}

/// Named predicate over current metrics. `Err` is the failure message.
pub type CustomValidator =
    Arc<dyn Fn(&ProgressMetrics) -> std::result::Result<(), String> + Send + Sync>;

/// A phase ended because a progress check failed and the checkpoint was restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseAbort {
    pub phase_id: String,
    pub checkpoint_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Completed(PhaseResult),
    Aborted(PhaseAbort),
}

impl PhaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(result) if result.success)
    }
}

/// Tool loop ended early on a failed progress check.
struct ProgressFailure {
    tool: String,
    validation: ValidationResult,
}

enum ToolLoop {
    Finished {
        checkpoint: GitStash,
        before: ProgressMetrics,
        files_processed: usize,
        changes_applied: u32,
    },
    Halted {
        checkpoint: GitStash,
        failure: ProgressFailure,
    },
}

pub struct PhaseOrchestrator {
    safety: Arc<dyn SafetyNet>,
    tools: Arc<dyn ToolExecutor>,
    metrics: Arc<dyn MetricsSource>,
    checks: Option<Arc<dyn ProjectChecks>>,
    settings: SafetySettings,
    targets: ProgressTargets,
    validators: HashMap<String, CustomValidator>,
    statuses: Mutex<BTreeMap<String, PhaseStatus>>,
    report: Option<Mutex<ReportWriter>>,
}

impl std::fmt::Debug for PhaseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseOrchestrator")
            .field("settings", &self.settings)
            .field("targets", &self.targets)
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("has_checks", &self.checks.is_some())
            .finish_non_exhaustive()
    }
}

impl PhaseOrchestrator {
    pub fn new(
        safety: Arc<dyn SafetyNet>,
        tools: Arc<dyn ToolExecutor>,
        metrics: Arc<dyn MetricsSource>,
        settings: SafetySettings,
        targets: ProgressTargets,
    ) -> Self {
        Self {
            safety,
            tools,
            metrics,
            checks: None,
            settings,
            targets,
            validators: HashMap::new(),
            statuses: Mutex::new(BTreeMap::new()),
            report: None,
        }
    }

    /// Run build/test checks between tools at the configured frequencies.
    #[must_use]
    pub fn with_checks(mut self, checks: Arc<dyn ProjectChecks>) -> Self {
        self.checks = Some(checks);
        self
    }

    /// Append a row per executed phase to a TSV ledger.
    #[must_use]
    pub fn with_report_writer(mut self, writer: ReportWriter) -> Self {
        self.report = Some(Mutex::new(writer));
        self
    }

    pub fn register_validator(&mut self, name: impl Into<String>, validator: CustomValidator) {
        self.validators.insert(name.into(), validator);
    }

    pub fn settings(&self) -> &SafetySettings {
        &self.settings
    }

    fn lock_statuses(&self) -> MutexGuard<'_, BTreeMap<String, PhaseStatus>> {
        match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_status(&self, phase_id: &str, status: PhaseStatus) {
        self.lock_statuses().insert(phase_id.to_string(), status);
    }

    pub fn phase_status(&self, phase_id: &str) -> PhaseStatus {
        self.lock_statuses()
            .get(phase_id)
            .copied()
            .unwrap_or(PhaseStatus::NotStarted)
    }

    pub fn statuses(&self) -> BTreeMap<String, PhaseStatus> {
        self.lock_statuses().clone()
    }

    fn event(
        &self,
        events: &mut Vec<SafetyEvent>,
        event_type: SafetyEventType,
        severity: EventSeverity,
        description: String,
        action: &str,
    ) {
        events.push(self.safety.log_event(event_type, severity, description, action));
    }

    /// Execute one phase.
    ///
    /// Returns `Err` for configuration errors and for a rollback that itself
    /// failed. Every other failure is a `Completed` result with `success` unset.
    pub async fn execute_phase(&self, phase: &CampaignPhase) -> Result<PhaseOutcome> {
        if phase.success_criteria.is_empty() {
            return Err(OrchestratorError::MissingCriteria(phase.id.clone()));
        }

        let started = Instant::now();
        let mut events = Vec::new();
        self.set_status(&phase.id, PhaseStatus::Running);
        self.event(
            &mut events,
            SafetyEventType::PhaseStart,
            EventSeverity::Info,
            format!("phase {} ({}) started with {} tool(s)", phase.id, phase.name, phase.tools.len()),
            "phase-start",
        );

        let mut final_metrics = None;
        let outcome = match self.run_tools(phase).await {
            Ok(ToolLoop::Finished {
                checkpoint,
                before,
                files_processed,
                changes_applied,
            }) => {
                match self
                    .finish_phase(phase, &checkpoint, &before, files_processed, changes_applied, started, &mut events)
                    .await
                {
                    Ok((result, after)) => {
                        final_metrics = Some(after);
                        PhaseOutcome::Completed(result)
                    }
                    Err(err) => PhaseOutcome::Completed(self.fail_phase(phase, &err, started, &mut events)),
                }
            }
            Ok(ToolLoop::Halted { checkpoint, failure }) => {
                let reason = format!(
                    "tool execution failed: {} failed progress validation: {}",
                    failure.tool,
                    failure.validation.errors.join("; ")
                );
                if self.settings.automatic_rollback_enabled {
                    return self.abort_phase(phase, checkpoint, reason, started).await;
                }
                PhaseOutcome::Completed(self.fail_phase(phase, &reason, started, &mut events))
            }
            Err(err) => PhaseOutcome::Completed(self.fail_phase(phase, &err, started, &mut events)),
        };

        self.write_report_row(phase, &outcome, final_metrics, started.elapsed());
        Ok(outcome)
    }

    async fn run_tools(&self, phase: &CampaignPhase) -> Result<ToolLoop> {
        let checkpoint = self
            .safety
            .checkpoint(&format!("pre-phase {}", phase.name), Some(&phase.id))
            .await?;
        let before = self.metrics.current().await?;

        let mut files_processed = 0usize;
        let mut changes_applied = 0u32;
        for (index, tool) in phase.tools.iter().enumerate() {
            let generation = self.safety.generation();
            let outcome = self.tools.execute(tool).await?;
            files_processed += outcome.files_processed.len();
            changes_applied = changes_applied.saturating_add(outcome.changes_applied);

            let validation = self
                .validate_progress(index, &outcome.files_processed, generation)
                .await;
            for warning in &validation.warnings {
                warn!(phase_id = %phase.id, tool = %tool.name(), "{warning}");
            }
            if !validation.success {
                return Ok(ToolLoop::Halted {
                    checkpoint,
                    failure: ProgressFailure {
                        tool: tool.name(),
                        validation,
                    },
                });
            }
            info!(
                phase_id = %phase.id,
                tool = %tool.name(),
                files = outcome.files_processed.len(),
                changes = outcome.changes_applied,
                "tool validated"
            );
        }

        Ok(ToolLoop::Finished {
            checkpoint,
            before,
            files_processed,
            changes_applied,
        })
    }

    /// Checks run after each tool.
    ///
    /// Errors: a checkpoint restored while the tool ran, `HIGH` or worse
    /// corruption in the files it touched, a failed build. Lower corruption
    /// and failing tests are warnings.
    async fn validate_progress(&self, index: usize, files: &[PathBuf], generation: u64) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.safety.generation() != generation {
            errors.push("a checkpoint was restored while the tool was running".to_string());
        }

        if self.settings.corruption_detection_enabled && !files.is_empty() {
            let report = self.safety.scan(files);
            if report.has_corruption() {
                let ids: Vec<&str> = report
                    .corruption_patterns
                    .iter()
                    .map(|p| p.pattern_id.as_str())
                    .collect();
                let message = format!(
                    "{} corruption in {} file(s): {}",
                    report.severity.as_str(),
                    report.detected_files.len(),
                    ids.join(", ")
                );
                if report.severity >= CorruptionSeverity::High {
                    errors.push(message);
                } else {
                    warnings.push(message);
                }
            }
        }

        if let Some(checks) = &self.checks {
            let run = index + 1;
            if due(run, self.settings.build_validation_frequency) {
                if let Err(summary) = checks.build().await {
                    errors.push(format!("build failed: {summary}"));
                }
            }
            if due(run, self.settings.test_validation_frequency) {
                if let Err(summary) = checks.tests().await {
                    warnings.push(format!("tests failed: {summary}"));
                }
            }
        }

        ValidationResult::from_findings(errors, warnings)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_phase(
        &self,
        phase: &CampaignPhase,
        checkpoint: &GitStash,
        before: &ProgressMetrics,
        files_processed: usize,
        changes_applied: u32,
        started: Instant,
        events: &mut Vec<SafetyEvent>,
    ) -> Result<(PhaseResult, ProgressMetrics)> {
        let after = self.metrics.current().await?;
        let improvement = MetricsImprovement::between(before, &after);
        let validation = self.validate_against(phase, &after);

        let status = if validation.success {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        self.set_status(&phase.id, status);

        self.event(
            events,
            SafetyEventType::PhaseComplete,
            if validation.success {
                EventSeverity::Info
            } else {
                EventSeverity::Warning
            },
            if validation.success {
                format!("phase {} completed: {changes_applied} change(s) applied", phase.id)
            } else {
                format!(
                    "phase {} finished below its success criteria: {}",
                    phase.id,
                    validation.errors.join("; ")
                )
            },
            "phase-complete",
        );
        info!(
            phase_id = %phase.id,
            success = validation.success,
            checkpoint_id = %checkpoint.id,
            files_processed,
            "phase finished"
        );

        let result = PhaseResult {
            phase_id: phase.id.clone(),
            success: validation.success,
            errors_fixed: u32::try_from(improvement.typescript_errors_reduced.max(0)).unwrap_or(u32::MAX),
            metrics_improvement: improvement,
            files_processed,
            execution_time: started.elapsed(),
            safety_events: events.clone(),
        };
        Ok((result, after))
    }

    fn fail_phase(
        &self,
        phase: &CampaignPhase,
        err: &dyn std::fmt::Display,
        started: Instant,
        events: &mut Vec<SafetyEvent>,
    ) -> PhaseResult {
        error!(phase_id = %phase.id, error = %err, "phase failed");
        self.set_status(&phase.id, PhaseStatus::Failed);
        self.event(
            events,
            SafetyEventType::BuildFailure,
            EventSeverity::Error,
            format!("phase {} failed: {err}", phase.id),
            "phase-failed",
        );
        PhaseResult::failed(&phase.id, started.elapsed(), events.clone())
    }

    async fn abort_phase(
        &self,
        phase: &CampaignPhase,
        checkpoint: GitStash,
        reason: String,
        started: Instant,
    ) -> Result<PhaseOutcome> {
        warn!(
            phase_id = %phase.id,
            checkpoint_id = %checkpoint.id,
            reason = %reason,
            "progress validation failed; rolling back phase"
        );
        self.set_status(&phase.id, PhaseStatus::Failed);

        if let Err(source) = self.safety.restore_checkpoint(&checkpoint.id).await {
            self.safety.log_event(
                SafetyEventType::EmergencyRecovery,
                EventSeverity::Critical,
                format!(
                    "phase {} rollback to {} failed after: {reason}",
                    phase.id, checkpoint.id
                ),
                "phase-rollback:failed",
            );
            return Err(OrchestratorError::RollbackFailed {
                phase_id: phase.id.clone(),
                checkpoint_id: checkpoint.id,
                source,
            });
        }

        self.safety.log_event(
            SafetyEventType::RollbackTriggered,
            EventSeverity::Warning,
            format!("phase {} rolled back to {}: {reason}", phase.id, checkpoint.id),
            "phase-rollback",
        );
        let outcome = PhaseOutcome::Aborted(PhaseAbort {
            phase_id: phase.id.clone(),
            checkpoint_id: checkpoint.id,
            reason,
        });
        self.write_report_row(phase, &outcome, None, started.elapsed());
        Ok(outcome)
    }

    fn validate_against(&self, phase: &CampaignPhase, metrics: &ProgressMetrics) -> ValidationResult {
        let criteria = &phase.success_criteria;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Some(max) = criteria.typescript_errors {
            if metrics.typescript_errors > max {
                errors.push(format!(
                    "TypeScript errors: {} (target: <= {max})",
                    metrics.typescript_errors
                ));
            }
        }
        if let Some(max) = criteria.linting_warnings {
            if metrics.linting_warnings > max {
                errors.push(format!(
                    "linting warnings: {} (target: <= {max})",
                    metrics.linting_warnings
                ));
            }
        }
        if let Some(max) = criteria.build_time {
            if metrics.build_time > max {
                warnings.push(format!(
                    "build time: {:.1}s (target: <= {max:.1}s)",
                    metrics.build_time
                ));
            }
        }
        if let Some(min) = criteria.enterprise_systems {
            if metrics.enterprise_systems < min {
                errors.push(format!(
                    "enterprise systems: {} (target: >= {min})",
                    metrics.enterprise_systems
                ));
            }
        }
        if let Some(name) = &criteria.custom_validation {
            match self.validators.get(name) {
                Some(validator) => {
                    if let Err(message) = validator(metrics) {
                        errors.push(format!("custom validation {name} failed: {message}"));
                    }
                }
                None => errors.push(format!("custom validator {name} is not registered")),
            }
        }

        ValidationResult::from_findings(errors, warnings)
    }

    /// Compare current metrics with the phase's success criteria.
    pub async fn validate_phase_completion(&self, phase: &CampaignPhase) -> Result<ValidationResult> {
        if phase.success_criteria.is_empty() {
            return Err(OrchestratorError::MissingCriteria(phase.id.clone()));
        }
        let metrics = self.metrics.current().await?;
        Ok(self.validate_against(phase, &metrics))
    }

    pub async fn create_safety_checkpoint(&self, description: &str) -> Result<GitStash> {
        let stash = self.safety.checkpoint(description, None).await?;
        info!(stash_id = %stash.id, "safety checkpoint created");
        Ok(stash)
    }

    pub async fn rollback_to_checkpoint(&self, id: &str) -> Result<()> {
        warn!(stash_id = %id, "rolling back to checkpoint");
        self.safety.restore_checkpoint(id).await?;
        info!(stash_id = %id, "rollback complete");
        Ok(())
    }

    pub async fn generate_phase_report(&self, phase: &CampaignPhase) -> Result<PhaseReport> {
        let metrics = self.metrics.current().await?;
        let validation = self.validate_against(phase, &metrics);
        let achievements = achievements(&metrics, &self.targets, phase, &validation);
        let recommendations = recommendations(&validation);

        Ok(PhaseReport {
            phase_id: phase.id.clone(),
            phase_name: phase.name.clone(),
            generated_at: Utc::now(),
            metrics,
            validation,
            achievements,
            recommendations,
        })
    }

    /// Append one ledger row. `metrics` is the post-phase snapshot, when one was taken.
    fn write_report_row(
        &self,
        phase: &CampaignPhase,
        outcome: &PhaseOutcome,
        metrics: Option<ProgressMetrics>,
        elapsed: Duration,
    ) {
        let Some(report) = &self.report else {
            return;
        };
        let now = Utc::now().timestamp_millis();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut row = match outcome {
            PhaseOutcome::Completed(result) => ReportRow::new(
                now,
                &phase.id,
                if result.success { "COMPLETED" } else { "FAILED" },
            )
            .with_duration_ms(duration_ms)
            .with_counts(result.files_processed, result.errors_fixed),
            PhaseOutcome::Aborted(abort) => ReportRow::new(now, &phase.id, "ABORTED")
                .with_duration_ms(duration_ms)
                .with_message(&abort.reason),
        };
        if let Some(metrics) = metrics {
            row = row.with_metrics(metrics);
        }

        let mut writer = match report.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writer.write_row(&row).and_then(|()| writer.flush()) {
            warn!(error = %err, "failed to write phase report row");
        }
    }
}

/// True on every `frequency`-th run; a frequency of 0 never fires.
fn due(run: usize, frequency: u32) -> bool {
    frequency > 0 && run % frequency as usize == 0
}

fn achievements(
    metrics: &ProgressMetrics,
    targets: &ProgressTargets,
    phase: &CampaignPhase,
    validation: &ValidationResult,
) -> Vec<String> {
    let mut out = Vec::new();
    if metrics.typescript_errors == 0 {
        out.push("Zero TypeScript errors achieved".to_string());
    } else if metrics.typescript_errors <= targets.typescript_errors {
        out.push(format!(
            "TypeScript errors within target ({})",
            metrics.typescript_errors
        ));
    }
    if metrics.linting_warnings == 0 {
        out.push("Zero linting warnings achieved".to_string());
    } else if metrics.linting_warnings <= targets.linting_warnings {
        out.push(format!(
            "Linting warnings within target ({})",
            metrics.linting_warnings
        ));
    }
    if metrics.build_time > 0.0 && metrics.build_time <= targets.build_time {
        out.push(format!(
            "Build time under target ({:.1}s <= {:.1}s)",
            metrics.build_time, targets.build_time
        ));
    }
    if metrics.enterprise_systems >= targets.enterprise_systems {
        out.push(format!(
            "Enterprise systems target reached ({})",
            metrics.enterprise_systems
        ));
    }
    if validation.success {
        out.push(format!("All success criteria met for {}", phase.name));
    }
    out
}

fn recommendations(validation: &ValidationResult) -> Vec<String> {
    let mut out: Vec<String> = validation
        .errors
        .iter()
        .map(|e| format!("Resolve before continuing: {e}"))
        .chain(validation.warnings.iter().map(|w| format!("Review: {w}")))
        .collect();
    if out.is_empty() {
        out.push("Proceed to the next phase".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ToolOutcome;
    use campaign_core::campaign::{SuccessCriteria, ToolConfiguration};
    use campaign_core::{CorruptionPattern, RecoveryAction};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeSafety {
        checkpoints: Mutex<Vec<String>>,
        rollbacks: Mutex<Vec<String>>,
        generation: AtomicU64,
        corrupt: Mutex<Vec<PathBuf>>,
        fail_checkpoint: bool,
    }

    #[async_trait]
    impl SafetyNet for FakeSafety {
        async fn checkpoint(&self, description: &str, phase: Option<&str>) -> std::result::Result<GitStash, SafetyError> {
            if self.fail_checkpoint {
                return Err(SafetyError::NoStashes);
            }
            let mut checkpoints = self.checkpoints.lock().unwrap();
            let id = format!("campaign-{}-{}-1", phase.unwrap_or("none"), checkpoints.len() + 1);
            checkpoints.push(id.clone());
            Ok(GitStash {
                id,
                description: description.to_string(),
                created_at: Utc::now(),
                branch: "main".to_string(),
                sequence: checkpoints.len() as u64,
                phase: phase.map(ToString::to_string),
                base_commit: "abc".to_string(),
                stash_ref: None,
            })
        }

        async fn restore_checkpoint(&self, id: &str) -> std::result::Result<(), SafetyError> {
            self.rollbacks.lock().unwrap().push(id.to_string());
            self.generation.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn scan(&self, files: &[PathBuf]) -> CorruptionReport {
            let corrupt = self.corrupt.lock().unwrap();
            let hits: Vec<PathBuf> = files.iter().filter(|f| corrupt.contains(f)).cloned().collect();
            if hits.is_empty() {
                return CorruptionReport::default();
            }
            CorruptionReport {
                detected_files: hits.clone(),
                corruption_patterns: vec![CorruptionPattern {
                    pattern_id: "IMPORT_DOUBLE_COMMA".to_string(),
                    description: "Double comma in import".to_string(),
                    severity: CorruptionSeverity::High,
                    files: hits,
                }],
                severity: CorruptionSeverity::High,
                recommended_action: RecoveryAction::Rollback,
            }
        }

        fn log_event(
            &self,
            event_type: SafetyEventType,
            severity: EventSeverity,
            description: String,
            action: &str,
        ) -> SafetyEvent {
            SafetyEvent::new(event_type, severity, description, action)
        }
    }

    struct ScriptedTools {
        outcomes: Mutex<VecDeque<std::result::Result<ToolOutcome, ToolError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTools {
        fn new(outcomes: Vec<std::result::Result<ToolOutcome, ToolError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedTools {
        async fn execute(&self, tool: &ToolConfiguration) -> std::result::Result<ToolOutcome, ToolError> {
            self.calls.lock().unwrap().push(tool.name());
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ToolOutcome::default()))
        }
    }

    struct SequenceMetrics(Mutex<VecDeque<ProgressMetrics>>);

    #[async_trait]
    impl MetricsSource for SequenceMetrics {
        async fn current(&self) -> std::result::Result<ProgressMetrics, MetricsError> {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                queue.front().cloned().ok_or(MetricsError::NoSummary)
            }
        }
    }

    fn metrics(errors: u32, warnings: u32) -> ProgressMetrics {
        ProgressMetrics {
            typescript_errors: errors,
            linting_warnings: warnings,
            build_time: 8.0,
            enterprise_systems: 0,
        }
    }

    fn phase(tools: usize) -> CampaignPhase {
        CampaignPhase {
            id: "phase1".to_string(),
            name: "Syntax cleanup".to_string(),
            description: String::new(),
            tools: (0..tools)
                .map(|i| ToolConfiguration::new(format!("fix-{i}.js")))
                .collect(),
            success_criteria: SuccessCriteria {
                typescript_errors: Some(0),
                build_time: Some(5.0),
                ..SuccessCriteria::default()
            },
            safety_checkpoints: Vec::new(),
        }
    }

    fn orchestrator(
        safety: Arc<FakeSafety>,
        tools: Arc<ScriptedTools>,
        sequence: Vec<ProgressMetrics>,
        auto_rollback: bool,
    ) -> PhaseOrchestrator {
        let settings = SafetySettings {
            automatic_rollback_enabled: auto_rollback,
            ..SafetySettings::default()
        };
        PhaseOrchestrator::new(
            safety,
            tools,
            Arc::new(SequenceMetrics(Mutex::new(sequence.into()))),
            settings,
            ProgressTargets::default(),
        )
    }

    fn touched(files: &[&str], changes: u32) -> std::result::Result<ToolOutcome, ToolError> {
        Ok(ToolOutcome {
            files_processed: files.iter().map(PathBuf::from).collect(),
            changes_applied: changes,
        })
    }

    #[tokio::test]
    async fn successful_phase_completes_with_events_and_improvement() {
        let safety = Arc::new(FakeSafety::default());
        let tools = Arc::new(ScriptedTools::new(vec![
            touched(&["a.ts", "b.ts"], 5),
            touched(&["c.ts"], 2),
        ]));
        let orch = orchestrator(safety.clone(), tools.clone(), vec![metrics(7, 3), metrics(0, 1)], true);

        let outcome = orch.execute_phase(&phase(2)).await.unwrap();
        let PhaseOutcome::Completed(result) = outcome else {
            panic!("phase should complete");
        };
        assert!(result.success);
        assert!(result.execution_time > Duration::ZERO);
        assert!(!result.safety_events.is_empty());
        assert_eq!(result.safety_events[0].event_type, SafetyEventType::PhaseStart);
        assert_eq!(result.files_processed, 3);
        assert_eq!(result.errors_fixed, 7);
        assert_eq!(result.metrics_improvement.linting_warnings_reduced, 2);
        assert_eq!(*tools.calls.lock().unwrap(), vec!["fix-0.js", "fix-1.js"]);
        assert_eq!(orch.phase_status("phase1"), PhaseStatus::Completed);
        assert!(safety.rollbacks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_progress_validation_rolls_back_once_and_aborts() {
        let safety = Arc::new(FakeSafety::default());
        safety.corrupt.lock().unwrap().push(PathBuf::from("bad.ts"));
        let tools = Arc::new(ScriptedTools::new(vec![
            touched(&["bad.ts"], 1),
            touched(&["c.ts"], 2),
        ]));
        let orch = orchestrator(safety.clone(), tools.clone(), vec![metrics(7, 3)], true);

        let outcome = orch.execute_phase(&phase(2)).await.unwrap();
        let PhaseOutcome::Aborted(abort) = outcome else {
            panic!("phase should abort");
        };
        let checkpoint = safety.checkpoints.lock().unwrap()[0].clone();
        assert_eq!(*safety.rollbacks.lock().unwrap(), vec![checkpoint.clone()]);
        assert_eq!(abort.checkpoint_id, checkpoint);
        assert!(abort.reason.contains("tool execution failed"));
        assert!(abort.reason.contains("IMPORT_DOUBLE_COMMA"));
        // The second tool never ran.
        assert_eq!(tools.calls.lock().unwrap().len(), 1);
        assert_eq!(orch.phase_status("phase1"), PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn failed_validation_without_auto_rollback_is_a_failed_result() {
        let safety = Arc::new(FakeSafety::default());
        safety.corrupt.lock().unwrap().push(PathBuf::from("bad.ts"));
        let tools = Arc::new(ScriptedTools::new(vec![touched(&["bad.ts"], 1)]));
        let orch = orchestrator(safety.clone(), tools, vec![metrics(7, 3)], false);

        let PhaseOutcome::Completed(result) = orch.execute_phase(&phase(1)).await.unwrap() else {
            panic!("no abort without automatic rollback");
        };
        assert!(!result.success);
        assert!(safety.rollbacks.lock().unwrap().is_empty());
        let last = result.safety_events.last().unwrap();
        assert_eq!(last.event_type, SafetyEventType::BuildFailure);
    }

    #[tokio::test]
    async fn tool_error_is_caught_as_failed_phase() {
        let safety = Arc::new(FakeSafety::default());
        let tools = Arc::new(ScriptedTools::new(vec![Err(ToolError::Failed {
            tool: "fix-0.js".to_string(),
            exit_code: 1,
            stderr: "boom".to_string(),
        })]));
        let orch = orchestrator(safety.clone(), tools, vec![metrics(7, 3)], true);

        let PhaseOutcome::Completed(result) = orch.execute_phase(&phase(2)).await.unwrap() else {
            panic!("tool errors do not abort");
        };
        assert!(!result.success);
        assert_eq!(result.files_processed, 0);
        assert_eq!(result.errors_fixed, 0);
        assert!(result
            .safety_events
            .iter()
            .any(|e| e.event_type == SafetyEventType::BuildFailure));
        assert!(safety.rollbacks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_failure_fails_the_phase() {
        let safety = Arc::new(FakeSafety {
            fail_checkpoint: true,
            ..FakeSafety::default()
        });
        let tools = Arc::new(ScriptedTools::new(Vec::new()));
        let orch = orchestrator(safety, tools.clone(), vec![metrics(0, 0)], true);

        let PhaseOutcome::Completed(result) = orch.execute_phase(&phase(1)).await.unwrap() else {
            panic!("expected failed result");
        };
        assert!(!result.success);
        assert!(tools.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_rollback_during_tool_fails_validation() {
        struct RollingTools(Arc<FakeSafety>);

        #[async_trait]
        impl ToolExecutor for RollingTools {
            async fn execute(&self, _tool: &ToolConfiguration) -> std::result::Result<ToolOutcome, ToolError> {
                self.0.generation.fetch_add(1, Ordering::SeqCst);
                Ok(ToolOutcome::default())
            }
        }

        let safety = Arc::new(FakeSafety::default());
        let orch = PhaseOrchestrator::new(
            safety.clone(),
            Arc::new(RollingTools(safety.clone())),
            Arc::new(SequenceMetrics(Mutex::new(vec![metrics(0, 0)].into()))),
            SafetySettings::default(),
            ProgressTargets::default(),
        );
        let PhaseOutcome::Aborted(abort) = orch.execute_phase(&phase(1)).await.unwrap() else {
            panic!("expected abort");
        };
        assert!(abort.reason.contains("checkpoint was restored"));
    }

    #[tokio::test]
    async fn completion_validation_compares_each_criterion() {
        let safety = Arc::new(FakeSafety::default());
        let tools = Arc::new(ScriptedTools::new(Vec::new()));
        let mut orch = orchestrator(
            safety,
            tools,
            vec![ProgressMetrics {
                typescript_errors: 3,
                linting_warnings: 0,
                build_time: 12.0,
                enterprise_systems: 10,
            }],
            true,
        );
        orch.register_validator(
            "enough-systems",
            Arc::new(|m: &ProgressMetrics| {
                if m.enterprise_systems >= 50 {
                    Ok(())
                } else {
                    Err(format!("only {} systems", m.enterprise_systems))
                }
            }),
        );

        let mut p = phase(1);
        p.success_criteria.custom_validation = Some("enough-systems".to_string());
        let validation = orch.validate_phase_completion(&p).await.unwrap();
        assert!(!validation.success);
        assert_eq!(validation.errors.len(), 2);
        assert!(validation.errors[0].contains("TypeScript errors: 3"));
        assert!(validation.errors[1].contains("only 10 systems"));
        assert_eq!(validation.warnings.len(), 1);
        assert!(validation.warnings[0].contains("build time"));

        p.success_criteria = SuccessCriteria::default();
        assert!(matches!(
            orch.validate_phase_completion(&p).await,
            Err(OrchestratorError::MissingCriteria(_))
        ));
    }

    #[tokio::test]
    async fn report_lists_achievements_and_recommendations() {
        let safety = Arc::new(FakeSafety::default());
        let tools = Arc::new(ScriptedTools::new(Vec::new()));
        let orch = orchestrator(safety, tools, vec![metrics(0, 4)], true);

        let report = orch.generate_phase_report(&phase(1)).await.unwrap();
        assert!(report.achievements.iter().any(|a| a == "Zero TypeScript errors achieved"));
        assert!(report.achievements.iter().any(|a| a.starts_with("All success criteria met")));
        assert!(report.recommendations.iter().any(|r| r.contains("build time")));
        assert!(report.to_markdown().contains("Syntax cleanup"));
    }

    #[tokio::test]
    async fn ledger_rows_carry_post_phase_metrics() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("phase-report.tsv");

        let safety = Arc::new(FakeSafety::default());
        let tools = Arc::new(ScriptedTools::new(vec![touched(&["a.ts"], 1)]));
        let orch = orchestrator(Arc::clone(&safety), tools, vec![metrics(7, 3), metrics(0, 1)], true)
            .with_report_writer(ReportWriter::new(&path).unwrap());
        assert!(orch.execute_phase(&phase(1)).await.unwrap().is_success());

        safety.corrupt.lock().unwrap().push(PathBuf::from("bad.ts"));
        let tools = Arc::new(ScriptedTools::new(vec![touched(&["bad.ts"], 1)]));
        let orch = orchestrator(Arc::clone(&safety), tools, vec![metrics(7, 3)], true)
            .with_report_writer(ReportWriter::new(&path).unwrap());
        let outcome = orch.execute_phase(&phase(1)).await.unwrap();
        assert!(matches!(outcome, PhaseOutcome::Aborted(_)));

        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<Vec<&str>> = content.lines().skip(1).map(|l| l.split('\t').collect()).collect();
        assert_eq!(rows.len(), 2);

        // files, fixed, ts errors, lint warnings, build time, enterprise
        assert_eq!(rows[0][2], "COMPLETED");
        assert_eq!(&rows[0][4..10], &["1", "7", "0", "1", "8.00", "0"]);

        // No snapshot is taken for an aborted phase.
        assert_eq!(rows[1][2], "ABORTED");
        assert!(rows[1][6..10].iter().all(|c| c.is_empty()));
        assert!(rows[1][10].contains("IMPORT_DOUBLE_COMMA"));
    }

    #[test]
    fn frequency_zero_never_fires() {
        assert!(!due(5, 0));
        assert!(due(5, 5));
        assert!(!due(4, 5));
        assert!(due(1, 1));
    }
}

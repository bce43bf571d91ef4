//! Safety protocol: checkpoints, corruption scans and rollback.
//!
//! Checkpoints are git stashes taken with untracked files and immediately
//! re-applied, so taking one never changes the work tree. Restoring one resets
//! tracked files to the commit it was taken on, removes untracked files, then
//! applies the stash commit.
//!
//! Locking: the stash registry sits behind an async mutex held for the whole
//! of every create/apply/drop, which serialises checkpoint mutations between
//! the orchestrator and the background monitor. The event log sits behind a
//! std mutex that is never held across an await. A rollback flag rejects a
//! second concurrent rollback outright.

use crate::corruption;
use crate::git::{Git, GitError};
use crate::monitor::{CorruptionMonitor, MonitorExit};
use crate::stash_store::{compose_stash_id, stash_phase, StashRegistry, StashStore, StashStoreError};
use crate::supervisor::{CommandSpec, ResourceLimits, Supervisor, SupervisorError};
use campaign_core::campaign::SafetySettings;
use campaign_core::{
    Config, CorruptionReport, CorruptionSeverity, EventLog, EventSeverity, GitStash,
    SafetyEvent, SafetyEventType, StashStatistics,
};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const EVENTS_FILE: &str = "safety-events.jsonl";

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] StashStoreError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("stash not found: {0}")]
    StashNotFound(String),
    #[error("no stashes available")]
    NoStashes,
    #[error("no stashes recorded for phase {0}")]
    NoStashesForPhase(String),
    #[error("snapshot for stash {0} no longer exists")]
    SnapshotMissing(String),
    #[error("a rollback is already in progress")]
    RollbackInProgress,
    #[error("checkpoint {id} was saved but its changes could not be put back: {source}")]
    SnapshotNotReapplied { id: String, source: GitError },
}

pub type Result<T> = std::result::Result<T, SafetyError>;

/// Clears the rollback flag when dropped.
#[derive(Debug)]
pub(crate) struct RollbackGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Checkpoint, scan and rollback operations over one git work tree.
#[derive(Debug)]
pub struct SafetyProtocol {
    git: Git,
    supervisor: Supervisor,
    config: Config,
    settings: SafetySettings,
    store: StashStore,
    stashes: tokio::sync::Mutex<StashRegistry>,
    events: Mutex<EventLog>,
    rollback_active: AtomicBool,
    rollback_generation: AtomicU64,
    monitor: tokio::sync::Mutex<Option<CorruptionMonitor>>,
}

impl SafetyProtocol {
    /// Open the protocol for `root`, loading the persisted stash registry.
    ///
    /// `config` paths must already be resolved against `root`.
    pub fn open(
        supervisor: Supervisor,
        root: impl Into<PathBuf>,
        config: Config,
        settings: SafetySettings,
    ) -> Result<Self> {
        let git = Git::new(supervisor.clone(), root, config.git_timeout_sec);
        let store = StashStore::new(&config.state_dir);
        let registry = store.load()?;
        debug!(
            stashes = registry.len(),
            counter = registry.counter,
            path = %store.path().display(),
            "stash registry loaded"
        );

        Ok(Self {
            git,
            supervisor,
            config,
            settings,
            store,
            stashes: tokio::sync::Mutex::new(registry),
            events: Mutex::new(EventLog::new()),
            rollback_active: AtomicBool::new(false),
            rollback_generation: AtomicU64::new(0),
            monitor: tokio::sync::Mutex::new(None),
        })
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &SafetySettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        self.git.root()
    }

    // --- Events ---

    fn lock_events(&self) -> MutexGuard<'_, EventLog> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a safety event in the log, the journal and tracing.
    pub fn record(
        &self,
        event_type: SafetyEventType,
        severity: EventSeverity,
        description: impl Into<String>,
        action: impl Into<String>,
    ) -> SafetyEvent {
        let event = SafetyEvent::new(event_type, severity, description, action);

        match severity {
            EventSeverity::Info => info!(
                event = event_type.as_str(),
                action = %event.action,
                "{}", event.description
            ),
            EventSeverity::Warning => warn!(
                event = event_type.as_str(),
                action = %event.action,
                "{}", event.description
            ),
            EventSeverity::Error | EventSeverity::Critical => error!(
                event = event_type.as_str(),
                severity = severity.as_str(),
                action = %event.action,
                "{}", event.description
            ),
        }

        let mut log = self.lock_events();
        if self.config.persist_events {
            self.append_journal(&event);
        }
        log.push(event.clone());
        event
    }

    fn append_journal(&self, event: &SafetyEvent) {
        let path = self.config.state_dir.join(EVENTS_FILE);
        let line = match event.to_json() {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize safety event");
                return;
            }
        };
        let written = crate::stash_store::ensure_ignored_dir(&self.config.state_dir)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| e.to_string())?;
                writeln!(file, "{line}").map_err(|e| e.to_string())
            });
        if let Err(err) = written {
            warn!(path = %path.display(), error = %err, "failed to append safety event");
        }
    }

    pub fn events(&self) -> Vec<SafetyEvent> {
        self.lock_events().snapshot()
    }

    pub fn event_count(&self) -> usize {
        self.lock_events().len()
    }

    /// Events persisted by this and earlier runs. Unreadable lines are skipped.
    pub fn journal(&self) -> Vec<SafetyEvent> {
        let path = self.config.state_dir.join(EVENTS_FILE);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    // --- Rollback guard ---

    pub(crate) fn begin_rollback(&self) -> Result<RollbackGuard<'_>> {
        if self
            .rollback_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.record(
                SafetyEventType::RollbackTriggered,
                EventSeverity::Warning,
                "rollback rejected: another rollback is in progress",
                "rollback:rejected",
            );
            return Err(SafetyError::RollbackInProgress);
        }
        Ok(RollbackGuard {
            flag: &self.rollback_active,
        })
    }

    pub fn is_rolling_back(&self) -> bool {
        self.rollback_active.load(Ordering::Acquire)
    }

    /// Incremented after every successful restore. Callers compare values
    /// taken before and after a step to notice a rollback they did not start.
    pub fn rollback_generation(&self) -> u64 {
        self.rollback_generation.load(Ordering::Acquire)
    }

    pub(crate) fn mark_restored(&self) {
        self.rollback_generation.fetch_add(1, Ordering::AcqRel);
    }

    // --- Checkpoints ---

    /// Snapshot the work tree (tracked and untracked) as a new checkpoint.
    pub async fn create_stash(&self, description: &str, phase: Option<&str>) -> Result<GitStash> {
        let mut registry = self.stashes.lock().await;
        match self.create_stash_locked(&mut registry, description, phase).await {
            Ok(stash) => {
                self.record(
                    SafetyEventType::CheckpointCreated,
                    EventSeverity::Info,
                    format!("created checkpoint {}: {description}", stash.id),
                    "stash-create",
                );
                Ok(stash)
            }
            Err(err) => {
                self.record(
                    SafetyEventType::EmergencyRecovery,
                    EventSeverity::Critical,
                    format!("checkpoint creation failed: {err}"),
                    "stash-create:failed",
                );
                Err(err)
            }
        }
    }

    async fn create_stash_locked(
        &self,
        registry: &mut StashRegistry,
        description: &str,
        phase: Option<&str>,
    ) -> Result<GitStash> {
        self.git.ensure_repository().await?;

        let branch = self.git.current_branch().await?;
        let base_commit = self.git.head_commit().await?;
        let sequence = registry.next_sequence();
        let created_at = Utc::now();
        let id = compose_stash_id(phase, sequence, created_at.timestamp_millis());

        let stash_ref = self.git.stash_push(&format!("{id}: {description}")).await?;
        let stash = GitStash {
            id,
            description: description.to_string(),
            created_at,
            branch,
            sequence,
            phase: phase.map(ToString::to_string),
            base_commit,
            stash_ref,
        };
        self.register_snapshot(registry, stash).await
    }

    /// Record a freshly pushed snapshot, then put its changes back in the
    /// work tree. The entry stays registered when the re-apply fails.
    async fn register_snapshot(&self, registry: &mut StashRegistry, stash: GitStash) -> Result<GitStash> {
        let sequence = stash.sequence;
        registry.insert(stash.clone());
        self.store.save(registry)?;

        if let Some(sha) = &stash.stash_ref {
            if let Err(source) = self.reapply_snapshot(sha).await {
                error!(stash_id = %stash.id, error = %source, "changes remain stashed");
                return Err(SafetyError::SnapshotNotReapplied {
                    id: stash.id,
                    source,
                });
            }
        }

        debug!(
            stash_id = %stash.id,
            sequence,
            has_snapshot = stash.stash_ref.is_some(),
            "checkpoint recorded"
        );
        Ok(stash)
    }

    async fn reapply_snapshot(&self, sha: &str) -> std::result::Result<(), GitError> {
        match self.git.stash_apply(sha, true).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(sha, error = %err, "apply with index failed; retrying without it");
                self.git.stash_apply(sha, false).await
            }
        }
    }

    /// Stash commit to apply for `stash`, falling back to a subject search
    /// when the stored reference is gone.
    pub(crate) async fn resolve_reference(&self, stash: &GitStash) -> Result<Option<String>> {
        if let Some(sha) = &stash.stash_ref {
            if self.git.commit_exists(sha).await? {
                return Ok(Some(sha.clone()));
            }
            warn!(stash_id = %stash.id, sha = %sha, "stored stash reference missing; searching by description");
        }
        match self.git.find_stash_by_message(&stash.id).await? {
            Some(entry) => Ok(Some(entry.sha)),
            None if stash.stash_ref.is_none() => Ok(None),
            None => Err(SafetyError::SnapshotMissing(stash.id.clone())),
        }
    }

    /// Reset to the checkpoint's base commit and re-apply its snapshot.
    async fn restore(&self, stash: &GitStash) -> Result<()> {
        let reference = self.resolve_reference(stash).await?;
        self.git.reset_hard(&stash.base_commit).await?;
        let removed = self.git.clean_untracked().await?;
        if let Some(reference) = reference {
            if let Err(err) = self.git.stash_apply(&reference, true).await {
                warn!(stash_id = %stash.id, error = %err, "index restore failed; applying without index");
                self.git.stash_apply(&reference, false).await?;
            }
        }
        debug!(stash_id = %stash.id, untracked_removed = removed, "work tree restored");
        Ok(())
    }

    /// Non-fatal post-restore checks.
    async fn post_restore_warnings(&self, stash: &GitStash) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.git.current_branch().await {
            Ok(branch) if branch != stash.branch => warnings.push(format!(
                "checkpoint was taken on {} but {branch} is checked out",
                stash.branch
            )),
            Ok(_) => {}
            Err(err) => warnings.push(format!("could not read current branch: {err}")),
        }
        match self.git.unmerged_paths().await {
            Ok(paths) if !paths.is_empty() => {
                warnings.push(format!("unmerged paths after restore: {}", paths.join(", ")));
            }
            Ok(_) => {}
            Err(err) => warnings.push(format!("could not check for unmerged paths: {err}")),
        }
        warnings
    }

    /// Restore a checkpoint by id.
    pub async fn apply_stash(&self, id: &str, validate_after: bool) -> Result<Vec<String>> {
        let _guard = self.begin_rollback()?;
        let registry = self.stashes.lock().await;

        let result = match registry.get(id).cloned() {
            Some(stash) => self.restore(&stash).await.map(|()| stash),
            None => Err(SafetyError::StashNotFound(id.to_string())),
        };
        drop(registry);

        let stash = match result {
            Ok(stash) => stash,
            Err(err) => {
                self.record(
                    SafetyEventType::EmergencyRecovery,
                    EventSeverity::Critical,
                    format!("failed to restore checkpoint {id}: {err}"),
                    "stash-apply:failed",
                );
                return Err(err);
            }
        };

        self.mark_restored();
        let warnings = if validate_after {
            self.post_restore_warnings(&stash).await
        } else {
            Vec::new()
        };
        for warning in &warnings {
            warn!(stash_id = %id, "{warning}");
        }

        self.record(
            SafetyEventType::RollbackTriggered,
            EventSeverity::Warning,
            format!("restored checkpoint {id}: {}", stash.description),
            "stash-apply",
        );
        Ok(warnings)
    }

    pub async fn auto_apply_latest_stash(&self) -> Result<GitStash> {
        let latest = self.stashes.lock().await.latest().cloned();
        let stash = latest.ok_or(SafetyError::NoStashes)?;
        self.apply_stash(&stash.id, true).await?;
        Ok(stash)
    }

    pub async fn apply_stash_by_phase(&self, phase: &str) -> Result<GitStash> {
        let latest = self.stashes.lock().await.latest_for_phase(phase).cloned();
        let stash = latest.ok_or_else(|| SafetyError::NoStashesForPhase(phase.to_string()))?;
        self.apply_stash(&stash.id, true).await?;
        Ok(stash)
    }

    /// Checkpoints oldest first.
    pub async fn list_stashes(&self) -> Vec<GitStash> {
        self.stashes
            .lock()
            .await
            .ordered()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_stash(&self, id: &str) -> Option<GitStash> {
        self.stashes.lock().await.get(id).cloned()
    }

    pub async fn latest_stash(&self) -> Option<GitStash> {
        self.stashes.lock().await.latest().cloned()
    }

    /// Drop the git snapshot behind `stash`. A missing snapshot only warns.
    async fn drop_snapshot(&self, stash: &GitStash) {
        let Some(sha) = &stash.stash_ref else {
            return;
        };
        match self.git.find_stash_by_sha(sha).await {
            Ok(Some(entry)) => {
                if let Err(err) = self.git.stash_drop(&entry.selector).await {
                    warn!(stash_id = %stash.id, error = %err, "failed to drop stash snapshot");
                }
            }
            Ok(None) => warn!(stash_id = %stash.id, "stash snapshot already gone"),
            Err(err) => warn!(stash_id = %stash.id, error = %err, "failed to list stashes"),
        }
    }

    /// Drop checkpoints older than the retention window. Returns how many.
    pub async fn cleanup_old_stashes(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.settings.stash_retention_days));
        let mut registry = self.stashes.lock().await;
        let expired: Vec<GitStash> = registry
            .ordered()
            .into_iter()
            .filter(|s| s.created_at < cutoff)
            .cloned()
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        for stash in &expired {
            self.drop_snapshot(stash).await;
            registry.remove(&stash.id);
        }
        self.store.save(&registry)?;

        info!(
            removed = expired.len(),
            retention_days = self.settings.stash_retention_days,
            "old checkpoints cleaned up"
        );
        Ok(expired.len())
    }

    /// Drop every checkpoint and its snapshot. Returns how many were removed.
    pub async fn drop_all_stashes(&self) -> Result<usize> {
        let mut registry = self.stashes.lock().await;
        let all: Vec<GitStash> = registry.ordered().into_iter().cloned().collect();
        for stash in &all {
            self.drop_snapshot(stash).await;
            registry.remove(&stash.id);
        }
        self.store.save(&registry)?;
        Ok(all.len())
    }

    pub async fn get_stash_statistics(&self) -> StashStatistics {
        let registry = self.stashes.lock().await;
        let mut stats = StashStatistics {
            total: registry.len(),
            ..StashStatistics::default()
        };
        for stash in registry.stashes.values() {
            if let Some(phase) = stash_phase(&stash.id) {
                *stats.by_phase.entry(phase).or_insert(0) += 1;
            }
            stats.oldest = Some(stats.oldest.map_or(stash.created_at, |t| t.min(stash.created_at)));
            stats.newest = Some(stats.newest.map_or(stash.created_at, |t| t.max(stash.created_at)));
        }
        stats
    }

    /// Restore the most recent checkpoint.
    pub async fn emergency_rollback(&self) -> Result<GitStash> {
        let Some(latest) = self.latest_stash().await else {
            self.record(
                SafetyEventType::EmergencyRecovery,
                EventSeverity::Critical,
                "emergency rollback failed: no checkpoints available",
                "emergency-rollback:failed",
            );
            return Err(SafetyError::NoStashes);
        };
        self.emergency_rollback_to(latest).await
    }

    /// Emergency-restore a checkpoint already chosen by the caller.
    pub async fn emergency_rollback_to(&self, stash: GitStash) -> Result<GitStash> {
        match self.apply_stash(&stash.id, true).await {
            Ok(_) => {
                self.record(
                    SafetyEventType::EmergencyRecovery,
                    EventSeverity::Warning,
                    format!("emergency rollback restored checkpoint {}", stash.id),
                    "emergency-rollback:success",
                );
                Ok(stash)
            }
            Err(err) => {
                self.record(
                    SafetyEventType::EmergencyRecovery,
                    EventSeverity::Critical,
                    format!("emergency rollback to {} failed: {err}", stash.id),
                    "emergency-rollback:failed",
                );
                Err(err)
            }
        }
    }

    // --- Corruption ---

    fn absolute(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        files
            .iter()
            .map(|f| if f.is_absolute() { f.clone() } else { self.root().join(f) })
            .collect()
    }

    fn note_corruption(&self, scan: &str, report: &CorruptionReport) {
        if !report.has_corruption() {
            return;
        }
        let severity = match report.severity {
            CorruptionSeverity::Critical => EventSeverity::Critical,
            CorruptionSeverity::High => EventSeverity::Error,
            CorruptionSeverity::Medium => EventSeverity::Warning,
            CorruptionSeverity::Low => EventSeverity::Info,
        };
        let ids: Vec<&str> = report
            .corruption_patterns
            .iter()
            .map(|p| p.pattern_id.as_str())
            .collect();
        self.record(
            SafetyEventType::CorruptionDetected,
            severity,
            format!(
                "{scan}: {} file(s) corrupted [{}], recommended action {}",
                report.detected_files.len(),
                ids.join(", "),
                report.recommended_action.as_str()
            ),
            format!("{scan}:{}", report.severity.as_str().to_lowercase()),
        );
    }

    /// Scan files against the corruption signature table.
    pub fn detect_corruption(&self, files: &[PathBuf]) -> CorruptionReport {
        let report = corruption::scan_files(&self.absolute(files));
        self.note_corruption("corruption-scan", &report);
        report
    }

    /// Scan source files for malformed import/export syntax only.
    pub fn detect_import_export_corruption(&self, files: &[PathBuf]) -> CorruptionReport {
        let report =
            corruption::scan_import_export(&self.absolute(files), &self.config.source_extensions);
        self.note_corruption("import-export-scan", &report);
        report
    }

    /// Run the type checker and report syntax-class diagnostics in `files`.
    pub async fn validate_syntax_with_typescript(&self, files: &[PathBuf]) -> Result<CorruptionReport> {
        let spec = CommandSpec::shell(&self.config.typecheck_cmd).current_dir(self.root());
        let output = self
            .supervisor
            .run(
                &spec,
                ResourceLimits::timeout_secs(self.config.typecheck_timeout_sec),
            )
            .await?;

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let diagnostics = corruption::parse_syntax_diagnostics(&combined);
        debug!(
            exit_code = output.exit_code,
            syntax_diagnostics = diagnostics.len(),
            "type checker finished"
        );
        let report = corruption::syntax_report(&diagnostics, &self.absolute(files), self.root());
        self.note_corruption("typescript-syntax", &report);
        Ok(report)
    }

    /// Tracked files with a configured source extension.
    pub async fn source_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .git
            .ls_files()
            .await?
            .into_iter()
            .map(PathBuf::from)
            .filter(|p| self.config.is_source_file(p))
            .map(|p| self.root().join(p))
            .collect())
    }

    // --- Real-time monitoring ---

    /// Start re-scanning `files` every `interval`. Replaces a running monitor.
    pub async fn start_real_time_monitoring(self: &Arc<Self>, files: Vec<PathBuf>, interval: Duration) {
        let mut slot = self.monitor.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        *slot = Some(CorruptionMonitor::spawn(
            Arc::downgrade(self),
            self.absolute(&files),
            interval,
            self.settings.automatic_rollback_enabled,
        ));
    }

    /// Stop the monitor and wait for it. Returns how it ended, if one ran.
    pub async fn stop_real_time_monitoring(&self) -> Option<MonitorExit> {
        let monitor = self.monitor.lock().await.take()?;
        let exit = monitor.stop().await;
        info!(exit = ?exit, "real-time corruption monitoring stopped");
        Some(exit)
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(CorruptionMonitor::is_active)
    }
}

//! Emergency recovery on top of the safety protocol.
//!
//! Rollback variants return errors like the protocol does. Nuclear reset and
//! selective recovery never return an error: everything that went wrong is
//! collected into the result so partial progress is still reported.

use crate::git::GitError;
use crate::safety::{SafetyError, SafetyProtocol};
use crate::verifier::{Verifier, VerifierConfig};
use campaign_core::{EventSeverity, GitStash, RecoveryValidationResult, SafetyEvent, SafetyEventType};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Methods counted by [`EmergencyRecovery::recovery_statistics`].
pub const RECOVERY_METHODS: [&str; 4] = [
    "emergency-rollback",
    "rollback-to-commit",
    "nuclear-reset",
    "selective-recovery",
];

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("commit not found: {0}")]
    CommitNotFound(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Take a checkpoint of the current state before rolling back.
    pub create_backup: bool,
    /// Run the full recovery validation afterwards.
    pub validate_after: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            validate_after: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NuclearResetOptions {
    /// Archive HEAD before resetting. Disabling this is the only way to skip it.
    pub create_backup: bool,
    /// Commit to reset to; current HEAD when unset.
    pub target_commit: Option<String>,
    pub preserve_metrics: bool,
    pub preserve_stashes: bool,
}

impl Default for NuclearResetOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            target_commit: None,
            preserve_metrics: false,
            preserve_stashes: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NuclearResetResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub target_commit: Option<String>,
    pub backup_created: Option<PathBuf>,
    pub backup_sha256: Option<String>,
    /// Paths that differed from the target commit before the reset.
    pub files_reset: usize,
    pub metrics_cleared: bool,
    pub stashes_cleared: usize,
    pub infrastructure_removed: usize,
    pub validation: Option<RecoveryValidationResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectiveRecoveryResult {
    pub success: bool,
    pub stash_id: Option<String>,
    pub recovered: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub nuclear: usize,
    pub by_method: BTreeMap<String, usize>,
}

/// Rollback, reset and validation routines for one work tree.
#[derive(Debug, Clone)]
pub struct EmergencyRecovery {
    safety: Arc<SafetyProtocol>,
    verifier: Verifier,
}

impl EmergencyRecovery {
    pub fn new(safety: Arc<SafetyProtocol>) -> Self {
        let verifier = Verifier::new(
            safety.supervisor().clone(),
            VerifierConfig::from_config(safety.config()),
            safety.root(),
        );
        Self { safety, verifier }
    }

    pub fn safety(&self) -> &Arc<SafetyProtocol> {
        &self.safety
    }

    fn record_outcome(&self, method: &str, success: bool, description: String) {
        let (severity, tag) = if success {
            (EventSeverity::Warning, format!("{method}:success"))
        } else {
            (EventSeverity::Critical, format!("{method}:failed"))
        };
        self.safety
            .record(SafetyEventType::EmergencyRecovery, severity, description, tag);
    }

    async fn backup_checkpoint(&self, reason: &str) -> Result<GitStash> {
        Ok(self
            .safety
            .create_stash(&format!("backup before {reason}"), None)
            .await?)
    }

    fn assumed_success(method: &str) -> RecoveryValidationResult {
        RecoveryValidationResult {
            success: true,
            warnings: vec!["validation skipped; recovery assumed successful".to_string()],
            recovery_method: method.to_string(),
            ..RecoveryValidationResult::default()
        }
    }

    /// Roll back to the latest checkpoint with optional backup and validation.
    ///
    /// The target is chosen before the backup is taken.
    pub async fn emergency_rollback_with_options(
        &self,
        options: RecoveryOptions,
    ) -> Result<RecoveryValidationResult> {
        const METHOD: &str = "emergency-rollback";
        let Some(target) = self.safety.latest_stash().await else {
            self.record_outcome(
                METHOD,
                false,
                "emergency rollback failed: no checkpoints available".to_string(),
            );
            return Err(SafetyError::NoStashes.into());
        };

        if options.create_backup {
            let backup = self.backup_checkpoint(METHOD).await?;
            info!(backup_id = %backup.id, target_id = %target.id, "pre-rollback backup taken");
        }

        self.safety.emergency_rollback_to(target).await?;

        if options.validate_after {
            Ok(self.validate_recovery_success(METHOD).await)
        } else {
            Ok(Self::assumed_success(METHOD))
        }
    }

    /// Hard-reset the work tree to `hash` and remove untracked files.
    pub async fn rollback_to_commit(
        &self,
        hash: &str,
        options: RecoveryOptions,
    ) -> Result<RecoveryValidationResult> {
        const METHOD: &str = "rollback-to-commit";
        let git = self.safety.git();

        if !git.commit_exists(hash).await? {
            self.record_outcome(METHOD, false, format!("rollback target {hash} does not exist"));
            return Err(RecoveryError::CommitNotFound(hash.to_string()));
        }

        if options.create_backup {
            self.backup_checkpoint(METHOD).await?;
        }

        let reset = async {
            let _guard = self.safety.begin_rollback()?;
            git.reset_hard(hash).await?;
            let removed = git.clean_untracked().await?;
            self.safety.mark_restored();
            Ok::<usize, RecoveryError>(removed)
        }
        .await;

        match reset {
            Ok(removed) => {
                self.record_outcome(
                    METHOD,
                    true,
                    format!("reset to {hash}; {removed} untracked path(s) removed"),
                );
            }
            Err(err) => {
                self.record_outcome(METHOD, false, format!("reset to {hash} failed: {err}"));
                return Err(err);
            }
        }

        if options.validate_after {
            Ok(self.validate_recovery_success(METHOD).await)
        } else {
            Ok(Self::assumed_success(METHOD))
        }
    }

    /// Archive, reset, clear metrics, stashes and campaign state, validate.
    pub async fn nuclear_reset(&self, options: NuclearResetOptions) -> NuclearResetResult {
        const METHOD: &str = "nuclear-reset";
        let mut result = NuclearResetResult::default();

        warn!(
            target_commit = ?options.target_commit,
            preserve_metrics = options.preserve_metrics,
            preserve_stashes = options.preserve_stashes,
            "nuclear reset starting"
        );

        let guard = match self.safety.begin_rollback() {
            Ok(guard) => guard,
            Err(err) => {
                result.errors.push(err.to_string());
                self.record_outcome(METHOD, false, format!("nuclear reset refused: {err}"));
                return result;
            }
        };

        if options.create_backup {
            match self.archive_backup().await {
                Ok((path, digest)) => {
                    result.backup_created = Some(path);
                    result.backup_sha256 = Some(digest);
                }
                Err(err) => {
                    // No reset without a backup.
                    result.errors.push(format!("backup failed: {err}"));
                    drop(guard);
                    self.record_outcome(METHOD, false, format!("nuclear reset aborted: backup failed: {err}"));
                    return result;
                }
            }
        } else {
            result.warnings.push("backup disabled".to_string());
        }

        if let Err(err) = self.reset_work_tree(&options, &mut result).await {
            result.errors.push(format!("reset failed: {err}"));
        }

        if options.preserve_metrics {
            result.warnings.push("metrics preserved".to_string());
        } else {
            self.clear_metrics(&mut result);
        }

        if options.preserve_stashes {
            result.warnings.push("stashes preserved".to_string());
        } else {
            match self.safety.drop_all_stashes().await {
                Ok(count) => result.stashes_cleared = count,
                Err(err) => result.errors.push(format!("failed to clear stash registry: {err}")),
            }
            if let Err(err) = self.safety.git().stash_clear().await {
                result.errors.push(format!("failed to clear git stashes: {err}"));
            }
        }

        self.remove_infrastructure(&mut result);
        drop(guard);

        let mut validation = self.validate_recovery_success(METHOD).await;
        self.check_nuclear_postconditions(&options, &mut validation).await;
        result.success = result.errors.is_empty() && validation.success;
        result.validation = Some(validation);

        self.record_outcome(
            METHOD,
            result.success,
            format!(
                "nuclear reset: {} file(s) reset, {} stash(es) cleared, metrics cleared: {}, {} error(s)",
                result.files_reset,
                result.stashes_cleared,
                result.metrics_cleared,
                result.errors.len()
            ),
        );
        result
    }

    async fn archive_backup(&self) -> std::result::Result<(PathBuf, String), String> {
        let backup_dir = &self.safety.config().backup_dir;
        crate::stash_store::ensure_ignored_dir(backup_dir).map_err(|e| e.to_string())?;

        let name = format!("backup-{}.tar.gz", Utc::now().format("%Y%m%dT%H%M%S%3fZ"));
        let path = backup_dir.join(name);
        self.safety
            .git()
            .archive_head(&path)
            .await
            .map_err(|e| e.to_string())?;

        let digest = compute_checksum(&path).map_err(|e| e.to_string())?;
        info!(path = %path.display(), sha256 = %digest, "backup archive written");
        Ok((path, digest))
    }

    async fn reset_work_tree(
        &self,
        options: &NuclearResetOptions,
        result: &mut NuclearResetResult,
    ) -> std::result::Result<(), RecoveryError> {
        let git = self.safety.git();
        let target = match &options.target_commit {
            Some(hash) => {
                if !git.commit_exists(hash).await? {
                    return Err(RecoveryError::CommitNotFound(hash.clone()));
                }
                hash.clone()
            }
            None => git.head_commit().await?,
        };
        result.target_commit = Some(target.clone());
        result.files_reset = git.changed_since(&target).await?.len();

        git.reset_hard(&target).await?;
        git.clean_untracked().await?;
        self.safety.mark_restored();
        Ok(())
    }

    fn clear_metrics(&self, result: &mut NuclearResetResult) {
        let mut cleared = true;
        for path in &self.safety.config().metrics_paths {
            if let Err(err) = remove_path(path) {
                cleared = false;
                result
                    .errors
                    .push(format!("failed to clear metrics {}: {err}", path.display()));
            }
        }
        result.metrics_cleared = cleared;
    }

    fn remove_infrastructure(&self, result: &mut NuclearResetResult) {
        for path in &self.safety.config().infrastructure_paths {
            let existed = path.exists();
            match remove_path(path) {
                Ok(()) if existed => result.infrastructure_removed += 1,
                Ok(()) => {}
                Err(err) => result
                    .warnings
                    .push(format!("failed to remove {}: {err}", path.display())),
            }
        }
    }

    async fn check_nuclear_postconditions(
        &self,
        options: &NuclearResetOptions,
        validation: &mut RecoveryValidationResult,
    ) {
        if !options.preserve_metrics {
            let remaining: Vec<String> = self
                .safety
                .config()
                .metrics_paths
                .iter()
                .filter(|p| p.exists())
                .map(|p| p.display().to_string())
                .collect();
            if !remaining.is_empty() {
                validation
                    .errors
                    .push(format!("metrics not cleared: {}", remaining.join(", ")));
            }
        }
        if !options.preserve_stashes {
            let tracked = self.safety.list_stashes().await.len();
            let in_git = self
                .safety
                .git()
                .stash_list()
                .await
                .map_or(0, |list| list.len());
            if tracked + in_git > 0 {
                validation.errors.push(format!(
                    "stashes not cleared: {tracked} tracked, {in_git} in git"
                ));
            }
        }
        validation.success = validation.errors.is_empty() && validation.build_validation;
    }

    /// Restore only `targets` from a checkpoint (latest when `from_stash` is unset).
    ///
    /// The checkpoint's snapshot is pinned on a disposable branch and paths are
    /// checked out from it without leaving the current branch.
    pub async fn selective_recovery(
        &self,
        targets: &[String],
        from_stash: Option<&str>,
    ) -> SelectiveRecoveryResult {
        const METHOD: &str = "selective-recovery";
        let mut result = SelectiveRecoveryResult::default();

        let stash = match from_stash {
            Some(id) => self.safety.get_stash(id).await,
            None => self.safety.latest_stash().await,
        };
        let Some(stash) = stash else {
            result.errors.push(match from_stash {
                Some(id) => format!("stash not found: {id}"),
                None => "no stashes available".to_string(),
            });
            self.record_outcome(METHOD, false, "selective recovery failed: no checkpoint".to_string());
            return result;
        };
        result.stash_id = Some(stash.id.clone());

        let source = match self.safety.resolve_reference(&stash).await {
            Ok(Some(sha)) => sha,
            Ok(None) => stash.base_commit.clone(),
            Err(err) => {
                result.errors.push(err.to_string());
                self.record_outcome(METHOD, false, format!("selective recovery failed: {err}"));
                return result;
            }
        };
        let untracked_source = stash.stash_ref.as_ref().map(|_| format!("{source}^3"));

        let git = self.safety.git();
        let original_branch = git.current_branch().await.ok();
        let temp_branch = format!("campaign-recovery-{}", Utc::now().timestamp_millis());

        match git.create_branch(&temp_branch, &source).await {
            Ok(()) => {
                for target in targets {
                    match git.checkout_paths(&temp_branch, &[target.as_str()]).await {
                        Ok(()) => result.recovered.push(target.clone()),
                        Err(tracked_err) => {
                            let from_untracked = match &untracked_source {
                                Some(untracked) => {
                                    git.checkout_paths(untracked, &[target.as_str()]).await.is_ok()
                                }
                                None => false,
                            };
                            if from_untracked {
                                result.recovered.push(target.clone());
                            } else {
                                result
                                    .errors
                                    .push(format!("failed to recover {target}: {tracked_err}"));
                            }
                        }
                    }
                }
            }
            Err(err) => result
                .errors
                .push(format!("failed to create recovery branch: {err}")),
        }

        // Cleanup runs whatever happened above.
        if let Some(original) = &original_branch {
            if git.current_branch().await.ok().as_ref() != Some(original) {
                if let Err(err) = git.checkout(original).await {
                    result
                        .errors
                        .push(format!("failed to return to {original}: {err}"));
                }
            }
        }
        if git.branch_exists(&temp_branch).await.unwrap_or(false) {
            if let Err(err) = git.delete_branch(&temp_branch).await {
                warn!(branch = %temp_branch, error = %err, "failed to delete recovery branch");
            }
        }

        result.success = result.errors.is_empty();
        self.record_outcome(
            METHOD,
            result.success,
            format!(
                "selective recovery from {}: {} of {} path(s) recovered",
                stash.id,
                result.recovered.len(),
                targets.len()
            ),
        );
        result
    }

    /// Composite post-recovery check.
    ///
    /// Conflicted paths, a failed build and any corruption are errors.
    /// Uncommitted changes and failing tests are warnings.
    pub async fn validate_recovery_success(&self, method: &str) -> RecoveryValidationResult {
        let git = self.safety.git();
        let mut validation = RecoveryValidationResult {
            recovery_method: method.to_string(),
            ..RecoveryValidationResult::default()
        };

        match git.unmerged_paths().await {
            Ok(paths) if !paths.is_empty() => validation
                .errors
                .push(format!("unmerged paths: {}", paths.join(", "))),
            Ok(_) => {}
            Err(err) => validation.errors.push(format!("git state unreadable: {err}")),
        }
        match git.status_porcelain().await {
            Ok(lines) if !lines.is_empty() => validation
                .warnings
                .push(format!("work tree has {} uncommitted change(s)", lines.len())),
            Ok(_) => {}
            Err(err) => validation.errors.push(format!("git status failed: {err}")),
        }
        match git.ls_files().await {
            Ok(files) => validation.files_restored = files.len(),
            Err(err) => validation.warnings.push(format!("could not count files: {err}")),
        }

        match self.verifier.run_build().await {
            Ok(check) if check.passed => validation.build_validation = true,
            Ok(check) => validation
                .errors
                .push(format!("build failed:\n{}", check.failure_summary())),
            Err(err) => validation.errors.push(format!("build did not complete: {err}")),
        }
        match self.verifier.run_tests().await {
            Ok(check) if check.passed => validation.test_validation = true,
            Ok(check) => validation
                .warnings
                .push(format!("tests failed:\n{}", check.failure_summary())),
            Err(err) => validation.warnings.push(format!("tests did not complete: {err}")),
        }

        match self.safety.source_files().await {
            Ok(files) => {
                let report = self.safety.detect_corruption(&files);
                if report.has_corruption() {
                    validation.errors.push(format!(
                        "corruption remains in {} file(s) ({})",
                        report.detected_files.len(),
                        report.severity.as_str()
                    ));
                }
            }
            Err(err) => validation
                .errors
                .push(format!("could not list source files: {err}")),
        }

        validation.metrics_cleared = self
            .safety
            .config()
            .metrics_paths
            .iter()
            .all(|p| !p.exists());
        validation.stashes_preserved = !self.safety.list_stashes().await.is_empty();
        validation.success = validation.errors.is_empty() && validation.build_validation;

        info!(
            method,
            success = validation.success,
            errors = validation.errors.len(),
            warnings = validation.warnings.len(),
            "recovery validation finished"
        );
        validation
    }

    /// Counts derived from recovery events recorded in this process.
    pub fn recovery_statistics(&self) -> RecoveryStatistics {
        tally_events(&self.safety.events())
    }

    /// Counts across every run, from the persisted event journal.
    pub fn journal_statistics(&self) -> RecoveryStatistics {
        tally_events(&self.safety.journal())
    }
}

fn tally_events(events: &[SafetyEvent]) -> RecoveryStatistics {
    tally(
        events
            .iter()
            .filter(|e| e.event_type == SafetyEventType::EmergencyRecovery)
            .map(|e| e.action.as_str()),
    )
}

fn tally<'a>(actions: impl Iterator<Item = &'a str>) -> RecoveryStatistics {
    let mut stats = RecoveryStatistics::default();
    for action in actions {
        let Some((method, outcome)) = action.split_once(':') else {
            continue;
        };
        if !RECOVERY_METHODS.contains(&method) {
            continue;
        }
        stats.total += 1;
        match outcome {
            "success" => stats.successful += 1,
            "failed" => stats.failed += 1,
            _ => {}
        }
        if method == "nuclear-reset" {
            stats.nuclear += 1;
        }
        *stats.by_method.entry(method.to_string()).or_insert(0) += 1;
    }
    stats
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn compute_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn statistics_count_recovery_tags_only() {
        let actions = [
            "emergency-rollback:success",
            "emergency-rollback:failed",
            "nuclear-reset:success",
            "selective-recovery:failed",
            "stash-create:failed",
            "stash-apply",
        ];
        let stats = tally(actions.into_iter());
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.nuclear, 1);
        assert_eq!(stats.by_method.get("emergency-rollback"), Some(&2));
        assert!(!stats.by_method.contains_key("stash-create"));
    }

    #[test]
    fn remove_path_handles_files_dirs_and_absent() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("metrics.json");
        let nested = dir.path().join("metrics");
        std::fs::write(&file, "{}").unwrap();
        std::fs::create_dir_all(nested.join("inner")).unwrap();
        std::fs::write(nested.join("inner/a.json"), "{}").unwrap();

        remove_path(&file).unwrap();
        remove_path(&nested).unwrap();
        remove_path(&dir.path().join("missing")).unwrap();
        assert!(!file.exists());
        assert!(!nested.exists());
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            compute_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn defaults_back_up_and_clear() {
        let options = NuclearResetOptions::default();
        assert!(options.create_backup);
        assert!(!options.preserve_metrics);
        assert!(!options.preserve_stashes);
        assert_eq!(RecoveryOptions::default(), RecoveryOptions {
            create_backup: true,
            validate_after: true,
        });
    }
}

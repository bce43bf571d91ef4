//! Core types for the campaign orchestrator.
//!
//! Checkpoints, corruption findings, phase outcomes and validation results
//! shared by the safety protocol, recovery system and phase orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for safety events and reports.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Severity attached to a safety event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Severity of a corruption finding. Ordered so that `max` picks the worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorruptionSeverity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl CorruptionSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Recommended response to a corruption report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    #[default]
    Continue,
    Retry,
    Rollback,
    EmergencyRestore,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Retry => "RETRY",
            Self::Rollback => "ROLLBACK",
            Self::EmergencyRestore => "EMERGENCY_RESTORE",
        }
    }
}

/// Caution hint for a tool. Orders execution, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Low,
    #[default]
    Medium,
    High,
    Maximum,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Maximum => "MAXIMUM",
        }
    }
}

/// Lifecycle of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// --- Metrics ---

/// Counters reported by the metrics collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressMetrics {
    pub typescript_errors: u32,
    pub linting_warnings: u32,
    /// Build duration in seconds.
    pub build_time: f64,
    pub enterprise_systems: u32,
}

/// Before/after deltas for one phase. Positive numbers are improvements.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsImprovement {
    pub typescript_errors_reduced: i64,
    pub linting_warnings_reduced: i64,
    pub build_time_improvement: f64,
    pub enterprise_systems_added: i64,
}

impl MetricsImprovement {
    pub fn between(before: &ProgressMetrics, after: &ProgressMetrics) -> Self {
        Self {
            typescript_errors_reduced: i64::from(before.typescript_errors)
                - i64::from(after.typescript_errors),
            linting_warnings_reduced: i64::from(before.linting_warnings)
                - i64::from(after.linting_warnings),
            build_time_improvement: before.build_time - after.build_time,
            enterprise_systems_added: i64::from(after.enterprise_systems)
                - i64::from(before.enterprise_systems),
        }
    }
}

// --- Phase outcome ---

/// Outcome of one `execute_phase` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub success: bool,
    pub metrics_improvement: MetricsImprovement,
    pub files_processed: usize,
    pub errors_fixed: u32,
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,
    pub safety_events: Vec<crate::events::SafetyEvent>,
}

impl PhaseResult {
    /// A failed result with zeroed counters.
    pub fn failed(
        phase_id: impl Into<String>,
        execution_time: Duration,
        safety_events: Vec<crate::events::SafetyEvent>,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            success: false,
            metrics_improvement: MetricsImprovement::default(),
            files_processed: 0,
            errors_fixed: 0,
            execution_time,
            safety_events,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// --- Checkpoints ---

/// A restorable snapshot of the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStash {
    /// `campaign[-<phase>]-<counter>-<timestamp_ms>`.
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    /// Counter value at creation; orders stashes.
    pub sequence: u64,
    pub phase: Option<String>,
    /// HEAD commit the snapshot was taken on.
    pub base_commit: String,
    /// Stash commit SHA, absent when the tree had nothing to save.
    pub stash_ref: Option<String>,
}

/// Aggregate view of the stash registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StashStatistics {
    pub total: usize,
    pub by_phase: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

// --- Corruption ---

/// One named signature that matched at least one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionPattern {
    pub pattern_id: String,
    pub description: String,
    pub severity: CorruptionSeverity,
    pub files: Vec<PathBuf>,
}

/// Result of a corruption scan. Computed fresh on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub detected_files: Vec<PathBuf>,
    pub corruption_patterns: Vec<CorruptionPattern>,
    pub severity: CorruptionSeverity,
    pub recommended_action: RecoveryAction,
}

impl CorruptionReport {
    pub fn has_corruption(&self) -> bool {
        !self.corruption_patterns.is_empty()
    }
}

// --- Validation ---

/// Generic errors/warnings result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Build a result whose `success` reflects the absence of errors.
    pub fn from_findings(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validation outcome after a recovery operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecoveryValidationResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recovery_method: String,
    pub files_restored: usize,
    pub metrics_cleared: bool,
    pub stashes_preserved: bool,
    pub build_validation: bool,
    pub test_validation: bool,
}

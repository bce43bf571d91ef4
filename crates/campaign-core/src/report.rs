//! Phase reports and the `phase-report.tsv` ledger.
//!
//! Columns: `timestamp_ms`, `phase_id`, outcome, `duration_ms`, `files_processed`,
//!          `errors_fixed`, `typescript_errors`, `linting_warnings`, `build_time`,
//!          `enterprise_systems`, message

use crate::types::{ProgressMetrics, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Human-facing summary of a phase against its criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_id: String,
    pub phase_name: String,
    pub generated_at: DateTime<Utc>,
    pub metrics: ProgressMetrics,
    pub validation: ValidationResult,
    pub achievements: Vec<String>,
    pub recommendations: Vec<String>,
}

impl PhaseReport {
    /// Render as a short markdown block.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("## {} ({})\n\n", self.phase_name, self.phase_id);
        out.push_str(&format!(
            "- status: {}\n- typescript errors: {}\n- linting warnings: {}\n- build time: {:.1}s\n- enterprise systems: {}\n",
            if self.validation.success { "PASSED" } else { "FAILED" },
            self.metrics.typescript_errors,
            self.metrics.linting_warnings,
            self.metrics.build_time,
            self.metrics.enterprise_systems,
        ));
        if !self.achievements.is_empty() {
            out.push_str("\n### Achievements\n");
            for a in &self.achievements {
                out.push_str(&format!("- {a}\n"));
            }
        }
        if !self.recommendations.is_empty() {
            out.push_str("\n### Recommendations\n");
            for r in &self.recommendations {
                out.push_str(&format!("- {r}\n"));
            }
        }
        out
    }
}

/// A single row in the phase-report.tsv file.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub phase_id: String,
    /// `COMPLETED`, `FAILED` or `ABORTED`.
    pub outcome: String,
    pub duration_ms: Option<u64>,
    pub files_processed: Option<usize>,
    pub errors_fixed: Option<u32>,
    pub metrics: Option<ProgressMetrics>,
    pub message: String,
}

impl ReportRow {
    /// Create a new report row with required fields.
    pub fn new(timestamp_ms: i64, phase_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            phase_id: phase_id.into(),
            outcome: outcome.into(),
            duration_ms: None,
            files_processed: None,
            errors_fixed: None,
            metrics: None,
            message: String::new(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_counts(mut self, files_processed: usize, errors_fixed: u32) -> Self {
        self.files_processed = Some(files_processed);
        self.errors_fixed = Some(errors_fixed);
        self
    }

    pub fn with_metrics(mut self, metrics: ProgressMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let files = self
            .files_processed
            .map(|f| f.to_string())
            .unwrap_or_default();
        let fixed = self.errors_fixed.map(|f| f.to_string()).unwrap_or_default();
        let (ts, lint, build, enterprise) = match &self.metrics {
            Some(m) => (
                m.typescript_errors.to_string(),
                m.linting_warnings.to_string(),
                format!("{:.2}", m.build_time),
                m.enterprise_systems.to_string(),
            ),
            None => Default::default(),
        };

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            sanitize_field(&self.phase_id),
            self.outcome,
            duration,
            files,
            fixed,
            ts,
            lint,
            build,
            enterprise,
            sanitize_field(&self.message),
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str = "timestamp_ms\tphase_id\toutcome\tduration_ms\tfiles_processed\terrors_fixed\ttypescript_errors\tlinting_warnings\tbuild_time\tenterprise_systems\tmessage";

/// Appending writer for phase-report.tsv.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Open for append, writing the header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

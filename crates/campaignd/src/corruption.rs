//! Corruption signatures and scanners.
//!
//! Signatures are a declarative table of pattern id, regex, severity and
//! description. Adding a signature means adding a row; the scan loop never
//! changes. Two structural heuristics run alongside the table: brace/paren
//! imbalance beyond a tolerance of 1, and a file ending mid-keyword. Both can
//! misfire on string literals containing brackets.

use campaign_core::{CorruptionPattern, CorruptionReport, CorruptionSeverity, RecoveryAction};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Allowed difference between opening and closing brace or paren counts.
pub const BRACKET_TOLERANCE: i64 = 1;

pub const FILE_READ_ERROR: &str = "FILE_READ_ERROR";
pub const STRUCTURAL_IMBALANCE: &str = "STRUCTURAL_IMBALANCE";
pub const TRUNCATED_STATEMENT: &str = "TRUNCATED_STATEMENT";
pub const TYPESCRIPT_SYNTAX_ERROR: &str = "TYPESCRIPT_SYNTAX_ERROR";

/// One row of a signature table.
#[derive(Debug)]
pub struct Signature {
    pub id: &'static str,
    pub description: &'static str,
    pub severity: CorruptionSeverity,
    pub matcher: Regex,
}

fn signature(
    id: &'static str,
    severity: CorruptionSeverity,
    description: &'static str,
    pattern: &str,
) -> Signature {
    Signature {
        id,
        description,
        severity,
        matcher: Regex::new(pattern).expect("signature regex is valid"),
    }
}

/// Whole-content signatures used by `scan_files`.
pub static CONTENT_SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    use CorruptionSeverity::{Critical, High, Medium};
    vec![
        signature(
            "MERGE_CONFLICT_MARKERS",
            Critical,
            "Git merge conflict markers left in file",
            r"(?m)^(?:<{7}|={7}|>{7})(?:[ \t].*)?$",
        ),
        signature(
            "IMPORT_LEADING_COMMA",
            High,
            "Malformed import/export: braces open with a stray comma",
            r"(?m)^\s*(?:import|export)\b[^;\n]*\{\s*,",
        ),
        signature(
            "DUPLICATE_IMPORT_EXPORT_KEYWORD",
            High,
            "Malformed import/export: duplicated keyword",
            r"\bimport\s+import\b|\bexport\s+export\b",
        ),
        signature(
            "IMPORT_TRAILING_COMMA",
            High,
            "Malformed import/export: statement terminated with a comma",
            r#"(?m)\}\s*from\s*['"][^'"\n]+['"]\s*,\s*$"#,
        ),
        signature(
            "IMPORT_DOUBLE_COMMA",
            High,
            "Malformed import/export: doubled comma in specifier list",
            r"(?m)^\s*(?:import|export)\b[^;\n]*,\s*,",
        ),
        signature(
            "OBJECT_LEADING_COMMA",
            High,
            "Malformed object literal: opens with a stray comma",
            r":\s*\{\s*,",
        ),
        signature(
            "CORRUPTED_PARAMETER_PREFIX",
            Medium,
            "Corrupted parameter name: repeated underscore prefix",
            r"(?:\(|,)\s*_{2,}[A-Za-z$][\w$]*\s*[:,)?]",
        ),
        signature(
            "CORRUPTED_PARAMETER_COLON",
            Medium,
            "Corrupted parameter name: doubled type annotation colon",
            r"(?:\(|,)\s*[A-Za-z_$][\w$]*\s*:\s*:",
        ),
    ]
});

/// Import/export-only signatures used by `scan_import_export`.
pub static IMPORT_EXPORT_SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    use CorruptionSeverity::{High, Medium};
    vec![
        signature(
            "EMPTY_IMPORT_BRACES",
            Medium,
            "Import with empty braces",
            r"(?m)^\s*(?:import|export)\s*(?:type\s*)?\{\s*\}\s*from\b",
        ),
        signature(
            "DUPLICATE_IMPORT_EXPORT_KEYWORD",
            High,
            "Malformed import/export: duplicated keyword",
            r"\bimport\s+import\b|\bexport\s+export\b",
        ),
        signature(
            "IMPORT_DOUBLE_COMMA",
            High,
            "Malformed import/export: doubled comma in specifier list",
            r"(?m)^\s*(?:import|export)\b[^;\n]*,\s*,",
        ),
        signature(
            "IMPORT_LEADING_COMMA",
            High,
            "Malformed import/export: braces open with a stray comma",
            r"(?m)^\s*(?:import|export)\b[^;\n]*\{\s*,",
        ),
        signature(
            "CORRUPTED_PATH_ALIAS",
            High,
            "Corrupted path alias in import source",
            r#"from\s*['"](?:@{2,}/|@/{2,}|@\s+/|@/@/)"#,
        ),
    ]
});

static TRUNCATED_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:import|export|from|const|let|var|function|return|class|interface|extends|implements)\s*\z",
    )
    .expect("truncation regex is valid")
});

static TSC_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<file>[^\s(][^(\n]*)\((?P<line>\d+),(?P<col>\d+)\):\s+error\s+TS(?P<code>\d+):\s*(?P<msg>.*)$",
    )
    .expect("tsc diagnostic regex is valid")
});

/// Map report severity and affected file count to an action.
pub fn recommend_action(severity: CorruptionSeverity, file_count: usize) -> RecoveryAction {
    match severity {
        CorruptionSeverity::Critical => RecoveryAction::EmergencyRestore,
        CorruptionSeverity::High => RecoveryAction::Rollback,
        _ if file_count > 10 => RecoveryAction::Rollback,
        CorruptionSeverity::Medium => RecoveryAction::Retry,
        _ if file_count > 5 => RecoveryAction::Retry,
        CorruptionSeverity::Low => RecoveryAction::Continue,
    }
}

/// Accumulates matches across files into a report.
#[derive(Debug, Default)]
struct ReportBuilder {
    patterns: BTreeMap<&'static str, CorruptionPattern>,
    detected: Vec<PathBuf>,
}

impl ReportBuilder {
    fn record(
        &mut self,
        id: &'static str,
        description: &str,
        severity: CorruptionSeverity,
        file: &Path,
    ) {
        let pattern = self
            .patterns
            .entry(id)
            .or_insert_with(|| CorruptionPattern {
                pattern_id: id.to_string(),
                description: description.to_string(),
                severity,
                files: Vec::new(),
            });
        if !pattern.files.iter().any(|f| f == file) {
            pattern.files.push(file.to_path_buf());
        }
        if !self.detected.iter().any(|f| f == file) {
            self.detected.push(file.to_path_buf());
        }
    }

    fn finish(self) -> CorruptionReport {
        let mut corruption_patterns: Vec<CorruptionPattern> = self.patterns.into_values().collect();
        corruption_patterns.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        let severity = corruption_patterns
            .iter()
            .map(|p| p.severity)
            .max()
            .unwrap_or_default();
        let recommended_action = if corruption_patterns.is_empty() {
            RecoveryAction::Continue
        } else {
            recommend_action(severity, self.detected.len())
        };
        CorruptionReport {
            detected_files: self.detected,
            corruption_patterns,
            severity,
            recommended_action,
        }
    }
}

/// Read a file for scanning. `None` means absent and skipped.
fn read_for_scan(file: &Path, builder: &mut ReportBuilder) -> Option<String> {
    if !file.exists() {
        debug!(file = %file.display(), "skipping absent file");
        return None;
    }
    match std::fs::read_to_string(file) {
        Ok(content) => Some(content),
        Err(err) => {
            warn!(file = %file.display(), error = %err, "failed to read file for corruption scan");
            builder.record(
                FILE_READ_ERROR,
                "File could not be read",
                CorruptionSeverity::High,
                file,
            );
            None
        }
    }
}

fn apply_table(table: &[Signature], content: &str, file: &Path, builder: &mut ReportBuilder) {
    for sig in table {
        if sig.matcher.is_match(content) {
            builder.record(sig.id, sig.description, sig.severity, file);
        }
    }
}

/// Difference between opening and closing counts of a bracket pair.
fn bracket_imbalance(content: &str, open: char, close: char) -> i64 {
    content.chars().fold(0i64, |acc, c| {
        if c == open {
            acc + 1
        } else if c == close {
            acc - 1
        } else {
            acc
        }
    })
}

fn apply_structural(content: &str, file: &Path, builder: &mut ReportBuilder) {
    let braces = bracket_imbalance(content, '{', '}');
    let parens = bracket_imbalance(content, '(', ')');
    if braces.abs() > BRACKET_TOLERANCE || parens.abs() > BRACKET_TOLERANCE {
        builder.record(
            STRUCTURAL_IMBALANCE,
            "Unbalanced braces or parentheses",
            CorruptionSeverity::High,
            file,
        );
    }
    if TRUNCATED_KEYWORD.is_match(content) {
        builder.record(
            TRUNCATED_STATEMENT,
            "Statement ends mid-keyword at end of file",
            CorruptionSeverity::High,
            file,
        );
    }
}

/// Full content scan: signature table plus structural checks.
pub fn scan_files(files: &[PathBuf]) -> CorruptionReport {
    let mut builder = ReportBuilder::default();
    for file in files {
        if let Some(content) = read_for_scan(file, &mut builder) {
            apply_table(&CONTENT_SIGNATURES, &content, file, &mut builder);
            apply_structural(&content, file, &mut builder);
        }
    }
    builder.finish()
}

/// Import/export scan restricted to files with one of `extensions`.
pub fn scan_import_export(files: &[PathBuf], extensions: &[String]) -> CorruptionReport {
    let mut builder = ReportBuilder::default();
    for file in files {
        let is_source = file
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|s| s == ext));
        if !is_source {
            continue;
        }
        if let Some(content) = read_for_scan(file, &mut builder) {
            apply_table(&IMPORT_EXPORT_SIGNATURES, &content, file, &mut builder);
        }
    }
    builder.finish()
}

/// A parser-class diagnostic from the type checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxDiagnostic {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub code: u32,
    pub message: String,
}

/// Extract syntax-class diagnostics (TS1000-TS1999) from `tsc` output.
/// Type errors (TS2xxx and up) are ignored.
pub fn parse_syntax_diagnostics(output: &str) -> Vec<SyntaxDiagnostic> {
    TSC_DIAGNOSTIC
        .captures_iter(output)
        .filter_map(|caps| {
            let code: u32 = caps["code"].parse().ok()?;
            if !(1000..2000).contains(&code) {
                return None;
            }
            Some(SyntaxDiagnostic {
                file: PathBuf::from(caps["file"].trim()),
                line: caps["line"].parse().ok()?,
                column: caps["col"].parse().ok()?,
                code,
                message: caps["msg"].trim().to_string(),
            })
        })
        .collect()
}

/// Report syntax diagnostics that belong to `files`. Any match is `HIGH`.
pub fn syntax_report(
    diagnostics: &[SyntaxDiagnostic],
    files: &[PathBuf],
    root: &Path,
) -> CorruptionReport {
    let mut builder = ReportBuilder::default();
    for diag in diagnostics {
        let absolute = if diag.file.is_absolute() {
            diag.file.clone()
        } else {
            root.join(&diag.file)
        };
        if let Some(file) = files
            .iter()
            .find(|f| **f == absolute || **f == diag.file || f.ends_with(&diag.file))
        {
            builder.record(
                TYPESCRIPT_SYNTAX_ERROR,
                "TypeScript syntax errors (TS1xxx)",
                CorruptionSeverity::High,
                file,
            );
        }
    }
    builder.finish()
}

/// Merge two reports; severity and action are recomputed.
pub fn merge_reports(a: CorruptionReport, b: CorruptionReport) -> CorruptionReport {
    let mut builder = ReportBuilder::default();
    for pattern in a.corruption_patterns.into_iter().chain(b.corruption_patterns) {
        let id: &'static str = known_id(&pattern.pattern_id);
        for file in &pattern.files {
            builder.record(id, &pattern.description, pattern.severity, file);
        }
    }
    builder.finish()
}

/// Map a pattern id back to its static name. Ids come from the tables above.
fn known_id(id: &str) -> &'static str {
    CONTENT_SIGNATURES
        .iter()
        .chain(IMPORT_EXPORT_SIGNATURES.iter())
        .map(|s| s.id)
        .chain([
            FILE_READ_ERROR,
            STRUCTURAL_IMBALANCE,
            TRUNCATED_STATEMENT,
            TYPESCRIPT_SYNTAX_ERROR,
        ])
        .find(|known| *known == id)
        .unwrap_or("UNKNOWN_PATTERN")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn merge_markers_are_critical() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "a.ts", "<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> x");
        let report = scan_files(&[file.clone()]);

        assert_eq!(report.severity, CorruptionSeverity::Critical);
        assert_eq!(report.recommended_action, RecoveryAction::EmergencyRestore);
        assert_eq!(report.detected_files, vec![file]);
        assert!(report
            .corruption_patterns
            .iter()
            .any(|p| p.description.to_lowercase().contains("merge conflict markers")));
    }

    #[test]
    fn clean_file_continues() {
        let dir = TempDir::new().unwrap();
        let file = write(
            &dir,
            "ok.ts",
            "import { a, b } from './x';\n\nexport function f(x: number) {\n  return { y: x };\n}\n",
        );
        let report = scan_files(&[file]);
        assert!(!report.has_corruption());
        assert_eq!(report.severity, CorruptionSeverity::Low);
        assert_eq!(report.recommended_action, RecoveryAction::Continue);
    }

    #[test]
    fn malformed_imports_are_high() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "b.ts", "import { , a } from './a';\nconst x = 1;\n");
        let report = scan_files(&[file]);
        assert_eq!(report.severity, CorruptionSeverity::High);
        assert_eq!(report.recommended_action, RecoveryAction::Rollback);
        assert_eq!(report.corruption_patterns[0].pattern_id, "IMPORT_LEADING_COMMA");
    }

    #[test]
    fn corrupted_parameters_are_medium() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "c.ts", "function f(___value: string) {\n  return 1;\n}\n");
        let report = scan_files(&[file]);
        assert_eq!(report.severity, CorruptionSeverity::Medium);
        assert_eq!(report.recommended_action, RecoveryAction::Retry);
    }

    #[test]
    fn structural_check_tolerates_one_unbalanced_brace() {
        let dir = TempDir::new().unwrap();
        let one = write(&dir, "one.ts", "const s = '{';\nfunction f() {\n  return 1;\n}\n");
        let two = write(&dir, "two.ts", "function f() {\n  if (x) {\n    return 1;\n");
        assert!(!scan_files(&[one]).has_corruption());
        let report = scan_files(&[two]);
        assert_eq!(report.corruption_patterns[0].pattern_id, STRUCTURAL_IMBALANCE);
        assert_eq!(report.severity, CorruptionSeverity::High);
    }

    #[test]
    fn truncated_statement_is_detected() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "t.ts", "const a = 1;\nexport\n");
        let report = scan_files(&[file]);
        assert!(report
            .corruption_patterns
            .iter()
            .any(|p| p.pattern_id == TRUNCATED_STATEMENT));
    }

    #[test]
    fn absent_files_are_skipped_and_unreadable_files_are_high() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.ts");
        let unreadable = dir.path().join("folder.ts");
        std::fs::create_dir(&unreadable).unwrap();

        let report = scan_files(&[missing, unreadable.clone()]);
        assert_eq!(report.detected_files, vec![unreadable]);
        assert_eq!(report.corruption_patterns[0].pattern_id, FILE_READ_ERROR);
        assert_eq!(report.severity, CorruptionSeverity::High);
    }

    #[test]
    fn severity_is_max_over_patterns_and_scan_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.ts", "function f(__x: number) { return 1; }\n");
        let b = write(&dir, "b.ts", "<<<<<<< ours\n=======\n>>>>>>> theirs\n");
        let files = vec![a, b];

        let first = scan_files(&files);
        let second = scan_files(&files);
        assert_eq!(first, second);

        let max = first.corruption_patterns.iter().map(|p| p.severity).max().unwrap();
        assert_eq!(first.severity, max);
        assert_eq!(first.severity, CorruptionSeverity::Critical);
    }

    #[test]
    fn many_low_files_escalate_by_count() {
        assert_eq!(recommend_action(CorruptionSeverity::Low, 11), RecoveryAction::Rollback);
        assert_eq!(recommend_action(CorruptionSeverity::Medium, 11), RecoveryAction::Rollback);
        assert_eq!(recommend_action(CorruptionSeverity::Low, 6), RecoveryAction::Retry);
        assert_eq!(recommend_action(CorruptionSeverity::Low, 5), RecoveryAction::Continue);
        assert_eq!(recommend_action(CorruptionSeverity::High, 1), RecoveryAction::Rollback);
    }

    #[test]
    fn import_export_scan_only_reads_source_files() {
        let dir = TempDir::new().unwrap();
        let ts = write(&dir, "a.ts", "import { a,, b } from './x';\n");
        let md = write(&dir, "notes.md", "import { a,, b } from './x';\n");
        let alias = write(&dir, "b.tsx", "import { C } from '@//components/C';\n");
        let empty = write(&dir, "c.js", "import {} from './side-effect';\n");
        let exts = vec!["ts".to_string(), "tsx".to_string(), "js".to_string()];

        let report = scan_import_export(&[ts.clone(), md.clone(), alias.clone(), empty.clone()], &exts);
        assert!(!report.detected_files.contains(&md));
        let ids: Vec<&str> = report
            .corruption_patterns
            .iter()
            .map(|p| p.pattern_id.as_str())
            .collect();
        assert!(ids.contains(&"IMPORT_DOUBLE_COMMA"));
        assert!(ids.contains(&"CORRUPTED_PATH_ALIAS"));
        assert!(ids.contains(&"EMPTY_IMPORT_BRACES"));
        assert_eq!(report.severity, CorruptionSeverity::High);
    }

    #[test]
    fn parses_only_syntax_class_tsc_diagnostics() {
        let output = "src/a.ts(3,14): error TS1005: ',' expected.\n\
                      src/b.ts(10,1): error TS2322: Type 'string' is not assignable to type 'number'.\n\
                      src/c.ts(1,1): error TS1128: Declaration or statement expected.\n\
                      Found 3 errors.\n";
        let diags = parse_syntax_diagnostics(output);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].file, PathBuf::from("src/a.ts"));
        assert_eq!(diags[0].line, 3);
        assert_eq!(diags[0].column, 14);
        assert_eq!(diags[0].code, 1005);
        assert_eq!(diags[1].code, 1128);
    }

    #[test]
    fn syntax_report_only_counts_requested_files() {
        let root = Path::new("/repo");
        let diags = parse_syntax_diagnostics(
            "src/a.ts(3,14): error TS1005: ',' expected.\nsrc/c.ts(1,1): error TS1128: Declaration or statement expected.\n",
        );
        let report = syntax_report(&diags, &[PathBuf::from("/repo/src/a.ts")], root);
        assert_eq!(report.detected_files, vec![PathBuf::from("/repo/src/a.ts")]);
        assert_eq!(report.severity, CorruptionSeverity::High);
        assert_eq!(report.recommended_action, RecoveryAction::Rollback);

        let none = syntax_report(&diags, &[PathBuf::from("/repo/src/z.ts")], root);
        assert!(!none.has_corruption());
    }

    #[test]
    fn merged_reports_recompute_severity() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.ts", "function f(__x: number) { return 1; }\n");
        let b = write(&dir, "b.ts", "<<<<<<< ours\n=======\n>>>>>>> theirs\n");
        let merged = merge_reports(scan_files(&[a]), scan_files(&[b]));
        assert_eq!(merged.detected_files.len(), 2);
        assert_eq!(merged.severity, CorruptionSeverity::Critical);
        assert_eq!(merged.recommended_action, RecoveryAction::EmergencyRestore);
    }
}

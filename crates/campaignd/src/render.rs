//! Terminal output for the campaignd CLI.

use campaign_core::{
    CorruptionReport, EventSeverity, GitStash, PhaseReport, RecoveryValidationResult,
    SafetyEvent, StashStatistics, ValidationResult,
};
use campaignd::orchestrator::PhaseOutcome;
use campaignd::recovery::{NuclearResetResult, RecoveryStatistics, SelectiveRecoveryResult};
use campaignd::supervisor::EmergencyStopReport;
use chrono::{DateTime, Utc};

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

pub fn print_stash_created(stash: &GitStash) {
    println!("Created checkpoint: {}", stash.id);
    println!("  Branch:   {}", stash.branch);
    println!("  Commit:   {}", stash.base_commit);
    match &stash.stash_ref {
        Some(sha) => println!("  Snapshot: {sha}"),
        None => println!("  Snapshot: (clean work tree)"),
    }
}

pub fn print_stash_list(stashes: &[GitStash]) {
    if stashes.is_empty() {
        println!("No checkpoints found.");
        return;
    }

    println!(
        "{:<44}  {:<12}  {:<19}  {:<30}",
        "ID", "PHASE", "CREATED", "DESCRIPTION"
    );
    println!("{}", "-".repeat(111));
    for stash in stashes {
        println!(
            "{:<44}  {:<12}  {:<19}  {:<30}",
            truncate(&stash.id, 44),
            truncate(stash.phase.as_deref().unwrap_or("-"), 12),
            format_time(&stash.created_at),
            truncate(&stash.description, 30),
        );
    }
    println!();
    println!("{} checkpoint(s)", stashes.len());
}

pub fn print_stash_stats(stats: &StashStatistics) {
    println!("Checkpoints: {}", stats.total);
    if let Some(oldest) = &stats.oldest {
        println!("  Oldest: {}", format_time(oldest));
    }
    if let Some(newest) = &stats.newest {
        println!("  Newest: {}", format_time(newest));
    }
    if !stats.by_phase.is_empty() {
        println!("  By phase:");
        for (phase, count) in &stats.by_phase {
            println!("    {phase:<20} {count}");
        }
    }
}

pub fn print_corruption_report(report: &CorruptionReport) {
    if !report.has_corruption() {
        println!("No corruption detected.");
        return;
    }
    println!(
        "Corruption: {} ({} file(s)), recommended action: {}",
        report.severity.as_str(),
        report.detected_files.len(),
        report.recommended_action.as_str()
    );
    for pattern in &report.corruption_patterns {
        println!(
            "  [{}] {} - {}",
            pattern.severity.as_str(),
            pattern.pattern_id,
            pattern.description
        );
        for file in &pattern.files {
            println!("      {}", file.display());
        }
    }
}

pub fn print_phase_outcome(phase_id: &str, outcome: &PhaseOutcome) {
    match outcome {
        PhaseOutcome::Completed(result) => {
            println!(
                "Phase {phase_id}: {}",
                if result.success { "COMPLETED" } else { "FAILED" }
            );
            println!("  Files processed: {}", result.files_processed);
            println!("  Errors fixed:    {}", result.errors_fixed);
            println!(
                "  Duration:        {:.1}s",
                result.execution_time.as_secs_f64()
            );
            let delta = &result.metrics_improvement;
            println!(
                "  Improvement:     errors {:+}, warnings {:+}, build {:+.1}s, systems {:+}",
                delta.typescript_errors_reduced,
                delta.linting_warnings_reduced,
                delta.build_time_improvement,
                delta.enterprise_systems_added
            );
        }
        PhaseOutcome::Aborted(abort) => {
            println!("Phase {phase_id}: ABORTED");
            println!("  Rolled back to: {}", abort.checkpoint_id);
            println!("  Reason:         {}", abort.reason);
        }
    }
}

fn print_findings(errors: &[String], warnings: &[String]) {
    for error in errors {
        println!("  error:   {error}");
    }
    for warning in warnings {
        println!("  warning: {warning}");
    }
}

pub fn print_validation(phase_id: &str, validation: &ValidationResult) {
    println!(
        "Phase {phase_id}: {}",
        if validation.success { "PASSED" } else { "FAILED" }
    );
    print_findings(&validation.errors, &validation.warnings);
}

pub fn print_report(report: &PhaseReport) {
    print!("{}", report.to_markdown());
}

pub fn print_recovery_validation(validation: &RecoveryValidationResult) {
    println!(
        "Recovery ({}): {}",
        validation.recovery_method,
        if validation.success { "OK" } else { "FAILED" }
    );
    println!("  Tracked files: {}", validation.files_restored);
    println!("  Build:         {}", pass_fail(validation.build_validation));
    println!("  Tests:         {}", pass_fail(validation.test_validation));
    print_findings(&validation.errors, &validation.warnings);
}

pub fn print_nuclear_result(result: &NuclearResetResult) {
    println!(
        "Nuclear reset: {}",
        if result.success { "OK" } else { "FAILED" }
    );
    if let Some(target) = &result.target_commit {
        println!("  Target:          {target}");
    }
    if let Some(path) = &result.backup_created {
        println!("  Backup:          {}", path.display());
    }
    if let Some(digest) = &result.backup_sha256 {
        println!("  Backup sha256:   {digest}");
    }
    println!("  Files reset:     {}", result.files_reset);
    println!("  Metrics cleared: {}", result.metrics_cleared);
    println!("  Stashes cleared: {}", result.stashes_cleared);
    print_findings(&result.errors, &result.warnings);
    if let Some(validation) = &result.validation {
        print_recovery_validation(validation);
    }
}

pub fn print_selective_result(result: &SelectiveRecoveryResult) {
    println!(
        "Selective recovery{}: {}",
        result
            .stash_id
            .as_deref()
            .map(|id| format!(" from {id}"))
            .unwrap_or_default(),
        if result.success { "OK" } else { "FAILED" }
    );
    for path in &result.recovered {
        println!("  recovered: {path}");
    }
    print_findings(&result.errors, &[]);
}

pub fn print_recovery_stats(stats: &RecoveryStatistics) {
    println!("Recoveries: {}", stats.total);
    println!("  Successful: {}", stats.successful);
    println!("  Failed:     {}", stats.failed);
    println!("  Nuclear:    {}", stats.nuclear);
    for (method, count) in &stats.by_method {
        println!("    {method:<20} {count}");
    }
}

pub fn print_emergency_stop(report: &EmergencyStopReport) {
    println!(
        "Emergency stop: {} tracked, {} stray process(es) killed",
        report.registered_killed, report.stray_killed
    );
}

/// Echo critical events to stderr so they are never lost in the log.
pub fn print_critical_events(events: &[SafetyEvent]) {
    for event in events
        .iter()
        .filter(|e| e.severity == EventSeverity::Critical)
    {
        eprintln!(
            "CRITICAL [{}] {}: {}",
            format_time(&event.timestamp),
            event.event_type.as_str(),
            event.description
        );
    }
}

fn pass_fail(ok: bool) -> &'static str {
    if ok {
        "passed"
    } else {
        "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_limit() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("campaign-phase1-12-1700000000000", 12), "campaign-...");
    }
}

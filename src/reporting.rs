use crate::engine::ExecutionResult;
use crate::runner::RunSummary;
use chrono::Local;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a message with mdBook-style timestamp, level and prefix.
fn format_line(level: &str, message: &str) -> String {
    format!(
        "{} [{}] (mdrun): {}",
        Local::now().format(TIMESTAMP_FORMAT),
        level,
        message
    )
}

fn error_line(message: &str) {
    eprintln!("{}", format_line("ERROR", message));
}

fn info_line(message: &str) {
    eprintln!("{}", format_line("INFO", message));
}

/// The failure report for a single example.
pub fn format_failure(result: &ExecutionResult) -> Vec<String> {
    let runnable = result.runnable();
    let mut lines = vec![
        "Example failed".to_string(),
        format!("File: {}:{}", runnable.source_file, runnable.line_offset),
        format!("Block: #{} ({})", result.index(), runnable.lang),
        format!("Exit code: {}", result.exit_code()),
        String::new(),
    ];

    if let Some(err) = result.error() {
        lines.extend(format!("{:#}", err).lines().map(str::to_string));
    }

    lines.push(String::new());
    lines.push("Code block:".to_string());
    lines.push(format!("{}{}", runnable.block_start, runnable.lang));
    lines.extend(runnable.lines.iter().cloned());
    lines.push(runnable.block_start.clone());
    lines
}

/// Prints every failure of `summary` to stderr.
pub fn report_failures(summary: &RunSummary) {
    if let Some(mismatch) = &summary.count_mismatch {
        error_line(&format!("{:#}", mismatch));
        return;
    }

    for err in &summary.source_errors {
        error_line(&format!("{:#}", err));
    }

    let mut failed_files = BTreeSet::new();
    for result in summary.failed() {
        for line in format_failure(result) {
            error_line(&line);
        }
        error_line("");
        failed_files.insert(result.runnable().source_file.as_str());
    }

    if !failed_files.is_empty() {
        error_line("Examples failed in the following files:");
        for file in failed_files {
            error_line(&format!("  {}", file));
        }
    }
}

/// Passed example counts per language, e.g. `go: 1, python: 3`.
fn language_counts(results: &[ExecutionResult]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for result in results.iter().filter(|r| r.is_success()) {
        *counts.entry(result.runnable().lang.as_str()).or_insert(0) += 1;
    }
    counts
}

fn average(total: Duration, count: usize) -> u128 {
    if count == 0 {
        0
    } else {
        total.as_millis() / count as u128
    }
}

/// Prints run statistics to stderr.
///
/// Shows:
/// - Passed examples with per-language counts
/// - Skipped examples
/// - Total time and average time per example
/// - Individual example timings (RUST_LOG=debug)
pub fn print_run_statistics(summary: &RunSummary) {
    let results = &summary.results;
    let counts = language_counts(results);
    let passed: usize = counts.values().sum();

    if results.is_empty() {
        info_line("No examples found to run");
        return;
    }

    let stats_str = counts
        .iter()
        .map(|(lang, count)| format!("{}: {}", lang, count))
        .collect::<Vec<_>>()
        .join(", ");
    info_line(&format!("Successfully ran {} example(s) ({})", passed, stats_str));

    let skipped = results.iter().filter(|r| r.is_skipped()).count();
    if skipped > 0 {
        info_line(&format!("Skipped {} example(s)", skipped));
    }

    let sum_duration: Duration = results.iter().map(|r| r.duration()).sum();
    info_line(&format!(
        "Finished in {}ms (avg {}ms per example)",
        summary.duration.as_millis(),
        average(sum_duration, results.len())
    ));

    log::debug!("Individual example timings:");
    for result in results {
        log::debug!(
            "[EXAMPLE_RUN_TIME] [{}] {} block #{}: {}ms",
            result.runnable().lang,
            result.runnable().source_file,
            result.index(),
            result.duration().as_millis()
        );
    }
}

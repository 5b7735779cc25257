use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::context::RunCounters;
use crate::engine::{FixupOutcome, ScriptStatus};
use crate::error::{FixupError, Result};

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| FixupError::io(path, e))
}

fn matching_reports(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut found = vec![];
    for entry in fs::read_dir(dir).map_err(|e| FixupError::io(dir, e))? {
        let path = entry.map_err(|e| FixupError::io(dir, e))?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |name| name.starts_with(prefix) && name.ends_with(".txt"));
        if matches && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Newest `<prefix>*.txt` report under `report_dir`.
///
/// The comparator writes one directory per run. Run directories are ranked
/// by modification time, newest first, and the first one holding a matching
/// report wins; report file names are not compared across runs. Reports
/// sitting directly in `report_dir` are used only when no run directory has one.
pub fn find_latest_report_file(report_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let mut runs = vec![];
    for entry in fs::read_dir(report_dir).map_err(|e| FixupError::io(report_dir, e))? {
        let path = entry.map_err(|e| FixupError::io(report_dir, e))?.path();
        if path.is_dir() {
            runs.push((modified(&path)?, path));
        }
    }
    runs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    for (_, run) in &runs {
        if let Some(report) = matching_reports(run, prefix)?.pop() {
            debug!(report = %report.display(), "latest chain report");
            return Ok(report);
        }
    }
    matching_reports(report_dir, prefix)?
        .pop()
        .ok_or_else(|| FixupError::ReportNotFound {
            dir: report_dir.to_path_buf(),
            prefix: prefix.to_string(),
        })
}

/// Per-round table followed by the run totals.
pub fn render_run_summary(outcome: &FixupOutcome, counters: &RunCounters, recompiled: Option<(usize, usize)>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>5}  {:>8}  {:>9}  {:>6}  {:>6}  {:>7}", "round", "executed", "succeeded", "failed", "errors", "skipped");
    for round in &outcome.rounds {
        let _ = writeln!(
            out,
            "{:>5}  {:>8}  {:>9}  {:>6}  {:>6}  {:>7}",
            round.round, round.executed, round.succeeded, round.failed, round.errors, round.skipped
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "statements run:      {}", counters.statements_run);
    let _ = writeln!(out, "statement failures:  {}", counters.statement_failures);
    let _ = writeln!(out, "already existing:    {}", counters.already_existing);
    let _ = writeln!(out, "scripts archived:    {}", counters.scripts_archived);
    let _ = writeln!(out, "total failures:      {}", outcome.total_failures);
    let _ = writeln!(out, "scripts remaining:   {}", outcome.remaining.len());
    if let Some((done, left)) = recompiled {
        let _ = writeln!(out, "recompiled:          {} ({} still invalid)", done, left);
    }

    let unresolved: Vec<_> = outcome
        .last_results
        .iter()
        .filter(|r| matches!(r.status, ScriptStatus::Failed | ScriptStatus::Error | ScriptStatus::Skipped))
        .filter(|r| outcome.remaining.contains(&r.path))
        .collect();
    if !unresolved.is_empty() {
        let _ = writeln!(out);
        for result in unresolved {
            let _ = writeln!(out, "{:<7} {}: {}", result.status, result.path.display(), result.message);
        }
    }
    out
}

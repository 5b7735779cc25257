//! Script execution and the multi-round convergence loop.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::error::{FixupError, Result};
use crate::executor::{OutcomeKind, SqlExecutor, StatementOutcome};
use crate::failure::FailureType;
use crate::objects::normalize_identifier;
use crate::scheduler::{collect_scripts, FixupScript};
use crate::statements::{is_schema_directive, parse_schema_directive, preview, schema_directive, split_sql_statements};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementFailure {
    pub statement_index: usize,
    pub error_message: String,
    pub statement_text: String,
    pub failure_type: FailureType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub statements_run: usize,
    pub failures: Vec<StatementFailure>,
    pub outcomes: HashMap<OutcomeKind, usize>,
    /// Set when a failed schema directive stopped the script early.
    pub aborted: bool,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.get(&kind).copied().unwrap_or(0)
    }

    /// Retrying can help only if every failure is of a retryable class.
    pub fn is_retryable(&self) -> bool {
        self.failures.iter().all(|f| f.failure_type.is_retryable())
    }
}

/// Splits `sql_text` and executes each statement.
///
/// When `schema` is given, or once the script itself switches schema with
/// `ALTER SESSION SET CURRENT_SCHEMA`, every following statement is sent
/// together with that directive, because each executor call is a fresh session.
/// "Already exists" errors are counted but not treated as failures, so a
/// script that partially applied in an earlier round can be run again in full.
pub fn execute_sql_statements<E: SqlExecutor + ?Sized>(
    executor: &E,
    sql_text: &str,
    schema: Option<&str>,
    timeout: Duration,
) -> ExecutionSummary {
    execute_statements(executor, &split_sql_statements(sql_text), schema, timeout)
}

/// Same as [`execute_sql_statements`] for statements that are already split.
pub fn execute_statements<E: SqlExecutor + ?Sized>(
    executor: &E,
    statements: &[String],
    schema: Option<&str>,
    timeout: Duration,
) -> ExecutionSummary {
    let mut summary = ExecutionSummary::default();
    let mut active_schema = schema.map(normalize_identifier);

    // an unusable schema must stop the script before anything lands elsewhere
    let check = match (&active_schema, statements.first()) {
        (Some(current), Some(first)) if !is_schema_directive(first) => Some(schema_directive(current)),
        _ => None,
    };
    let offset = usize::from(check.is_some());

    for (position, statement) in check.iter().chain(statements.iter()).enumerate() {
        let index = position.saturating_sub(offset);
        let directive = is_schema_directive(statement);
        let text = match (&active_schema, directive) {
            (Some(current), false) => format!("{}\n{}", schema_directive(current), statement),
            _ => statement.to_string(),
        };

        summary.statements_run += 1;
        let outcome = match executor.execute(&text, timeout) {
            Ok(output) => output.outcome(),
            Err(e) => StatementOutcome::Failed {
                failure: FailureType::Unknown,
                message: e.to_string(),
            },
        };
        *summary.outcomes.entry(OutcomeKind::from(&outcome)).or_default() += 1;

        match &outcome {
            StatementOutcome::Applied => {
                debug!(index, statement = %preview(statement, 80), "statement applied");
                if directive {
                    active_schema = parse_schema_directive(statement);
                }
            }
            StatementOutcome::AlreadyExists(message) => {
                debug!(index, %message, "object already exists");
            }
            StatementOutcome::NotFound(_) | StatementOutcome::Failed { .. } => {
                let failure_type = outcome.failure_type().unwrap_or(FailureType::Unknown);
                warn!(
                    index,
                    failure = %failure_type,
                    message = outcome.message(),
                    statement = %preview(statement, 80),
                    "statement failed"
                );
                summary.failures.push(StatementFailure {
                    statement_index: index,
                    error_message: outcome.message().to_string(),
                    statement_text: statement.clone(),
                    failure_type,
                });
                // without a schema the remaining statements would land in the wrong place
                if directive {
                    summary.aborted = true;
                    break;
                }
            }
        }
    }
    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptStatus {
    Success,
    Failed,
    Error,
    Skipped,
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptStatus::Success => "SUCCESS",
            ScriptStatus::Failed => "FAILED",
            ScriptStatus::Error => "ERROR",
            ScriptStatus::Skipped => "SKIPPED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResult {
    pub path: PathBuf,
    pub status: ScriptStatus,
    pub message: String,
    pub layer: usize,
    pub summary: ExecutionSummary,
    /// Set for FAILED and ERROR results.
    pub failure_type: Option<FailureType>,
    /// Whether running the script again in a later round can help.
    pub retryable: bool,
}

impl ScriptResult {
    fn new(script: &FixupScript, status: ScriptStatus, message: impl Into<String>) -> Self {
        ScriptResult {
            path: script.path.clone(),
            status,
            message: message.into(),
            layer: script.layer,
            summary: ExecutionSummary::default(),
            failure_type: None,
            retryable: true,
        }
    }
}

/// Per-script execution settings.
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    pub timeout: Duration,
    pub max_sql_file_bytes: u64,
    pub schema_from_filename: bool,
    /// Archive root mirroring the fixup tree, e.g. `<root>/done`.
    pub done_root: PathBuf,
}

/// Schema a script declares through its `SCHEMA.NAME.sql` file name.
pub fn declared_schema(script: &FixupScript) -> Option<String> {
    let stem = script.stem();
    let (schema, name) = stem.split_once('.')?;
    if schema.is_empty() || name.is_empty() {
        return None;
    }
    Some(normalize_identifier(schema))
}

/// Executes one script and archives it when every statement succeeded.
///
/// Files above `max_sql_file_bytes` are rejected with `ERROR` before anything
/// is read or executed.
pub fn execute_script_with_summary<E: SqlExecutor + ?Sized>(
    executor: &E,
    script: &FixupScript,
    options: &ScriptOptions,
) -> ScriptResult {
    let size = match fs::metadata(&script.path) {
        Ok(meta) => meta.len(),
        Err(e) => return error_result(script, format!("cannot stat script: {}", e), true),
    };
    if size > options.max_sql_file_bytes {
        return error_result(
            script,
            format!(
                "file size {} bytes exceeds the limit of {} bytes (max_sql_file_bytes); not executed",
                size, options.max_sql_file_bytes
            ),
            false,
        );
    }
    let sql = match script.read_sql() {
        Ok(sql) => sql,
        Err(e) => return error_result(script, e.to_string(), true),
    };
    if split_sql_statements(&sql).is_empty() {
        return ScriptResult::new(script, ScriptStatus::Skipped, "no executable statements");
    }

    let schema = if options.schema_from_filename {
        declared_schema(script)
    } else {
        None
    };
    let summary = execute_sql_statements(executor, &sql, schema.as_deref(), options.timeout);

    if summary.is_success() {
        let applied = summary.statements_run;
        let result = match archive_script(&script.path, &script.relative, &options.done_root) {
            Ok(dest) => {
                info!(path = %script.path.display(), layer = script.layer, statements = applied, "script applied");
                ScriptResult::new(script, ScriptStatus::Success, format!("applied {} statements, archived to {}", applied, dest.display()))
            }
            Err(e) => error_result(script, format!("applied but not archived: {}", e), true),
        };
        return ScriptResult { summary, ..result };
    }

    let first = &summary.failures[0];
    let failure_type = summary
        .failures
        .iter()
        .map(|f| f.failure_type)
        .find(|t| !t.is_retryable())
        .unwrap_or(first.failure_type);
    let message = format!(
        "{} of {} statements failed; first at #{}: {}",
        summary.failures.len(),
        summary.statements_run,
        first.statement_index + 1,
        first.error_message
    );
    warn!(path = %script.path.display(), failure = %failure_type, "{}", message);
    ScriptResult {
        failure_type: Some(failure_type),
        retryable: summary.is_retryable(),
        summary,
        ..ScriptResult::new(script, ScriptStatus::Failed, message)
    }
}

fn error_result(script: &FixupScript, message: String, retryable: bool) -> ScriptResult {
    error!(path = %script.path.display(), %message, "script not executed");
    ScriptResult {
        retryable,
        failure_type: Some(FailureType::Unknown),
        ..ScriptResult::new(script, ScriptStatus::Error, message)
    }
}

/// Moves `path` to `<done_root>/<relative>`, replacing an earlier archived copy.
pub fn archive_script(path: &Path, relative: &Path, done_root: &Path) -> Result<PathBuf> {
    let dest = done_root.join(relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| FixupError::io(parent, e))?;
    }
    if dest.exists() {
        fs::remove_file(&dest).map_err(|e| FixupError::io(&dest, e))?;
    }
    if fs::rename(path, &dest).is_err() {
        // different filesystem: fall back to copy and delete
        fs::copy(path, &dest).map_err(|e| FixupError::io(&dest, e))?;
        fs::remove_file(path).map_err(|e| FixupError::io(path, e))?;
    }
    Ok(dest)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub round: usize,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl RoundSummary {
    pub fn failures(&self) -> usize {
        self.failed + self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    MaxRounds,
    NoProgress,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FixupOutcome {
    pub rounds: Vec<RoundSummary>,
    /// Failures summed over every round, not just the last.
    pub total_failures: usize,
    /// Scripts still waiting in the fixup tree.
    pub remaining: Vec<PathBuf>,
    pub stop_reason: StopReason,
    /// Results of the last round, for reporting.
    pub last_results: Vec<ScriptResult>,
}

impl FixupOutcome {
    pub fn converged(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.converged() {
            0
        } else {
            1
        }
    }
}

/// Runs rounds until nothing is left, the round budget is spent, or a round
/// applies fewer than `min_progress` new scripts.
pub fn run_iterative_fixup<E: SqlExecutor>(ctx: &mut RunContext<E>) -> Result<FixupOutcome> {
    let root = ctx.config.fixup.root.clone();
    let scan = ctx.config.scan_options();
    let options = ScriptOptions {
        timeout: ctx.config.statement_timeout(),
        max_sql_file_bytes: ctx.config.fixup.max_sql_file_bytes,
        schema_from_filename: ctx.config.fixup.schema_from_filename,
        done_root: ctx.config.done_root(),
    };
    let max_rounds = ctx.config.fixup.max_rounds.max(1);
    let min_progress = ctx.config.fixup.min_progress;

    let mut rounds = vec![];
    let mut total_failures = 0;
    let mut last_results = vec![];
    let mut stop_reason = StopReason::MaxRounds;

    for round in 1..=max_rounds {
        if ctx.is_cancelled() {
            stop_reason = StopReason::Cancelled;
            break;
        }
        let scripts: Vec<FixupScript> = collect_scripts(&root, &scan)?
            .into_iter()
            .filter(|s| !ctx.empty_scripts.contains(&s.path))
            .collect();
        if scripts.is_empty() {
            stop_reason = StopReason::Converged;
            break;
        }
        info!(round, scripts = scripts.len(), "starting fixup round");

        let mut summary = RoundSummary {
            round,
            ..Default::default()
        };
        let mut results = Vec::with_capacity(scripts.len());
        for script in &scripts {
            if let Some(failure) = ctx.not_retried.get(&script.path) {
                summary.skipped += 1;
                results.push(ScriptResult::new(
                    script,
                    ScriptStatus::Skipped,
                    format!("not retried after {} failure", failure),
                ));
                continue;
            }

            let result = execute_script_with_summary(&ctx.executor, script, &options);
            ctx.counters.statements_run += result.summary.statements_run;
            ctx.counters.statement_failures += result.summary.failures.len();
            ctx.counters.already_existing += result.summary.count(OutcomeKind::AlreadyExists);
            match result.status {
                ScriptStatus::Success => {
                    summary.executed += 1;
                    summary.succeeded += 1;
                    ctx.counters.scripts_archived += 1;
                }
                ScriptStatus::Failed | ScriptStatus::Error => {
                    summary.executed += 1;
                    if result.status == ScriptStatus::Failed {
                        summary.failed += 1;
                    } else {
                        summary.errors += 1;
                    }
                    if !result.retryable {
                        ctx.not_retried
                            .insert(script.path.clone(), result.failure_type.unwrap_or(FailureType::Unknown));
                    }
                }
                ScriptStatus::Skipped => {
                    summary.skipped += 1;
                    ctx.empty_scripts.insert(script.path.clone());
                }
            }
            results.push(result);
        }

        total_failures += summary.failures();
        info!(
            round,
            succeeded = summary.succeeded,
            failed = summary.failed,
            errors = summary.errors,
            skipped = summary.skipped,
            total_failures,
            "fixup round finished"
        );
        let progress = summary.succeeded;
        let clean = summary.failures() == 0;
        let executed = summary.executed;
        rounds.push(summary);
        last_results = results;

        if clean && ctx.not_retried.is_empty() {
            stop_reason = StopReason::Converged;
            break;
        }
        if executed == 0 {
            // everything left is known not to succeed on a retry
            stop_reason = StopReason::NoProgress;
            break;
        }
        if round > 1 && progress < min_progress {
            warn!(round, progress, min_progress, "insufficient progress, stopping");
            stop_reason = StopReason::NoProgress;
            break;
        }
    }

    let remaining: Vec<PathBuf> = collect_scripts(&root, &scan)?
        .into_iter()
        .map(|s| s.path)
        .filter(|p| !ctx.empty_scripts.contains(p))
        .collect();
    if !remaining.is_empty() {
        error!(
            remaining = remaining.len(),
            total_failures,
            "fixup did not converge"
        );
    }

    Ok(FixupOutcome {
        rounds,
        total_failures,
        remaining,
        stop_reason,
        last_results,
    })
}

//! The boundary to the SQL client that talks to the target database.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use enum_kinds::EnumKind;
use tracing::{debug, warn};

use crate::error::{FixupError, Result};
use crate::failure::{classify_failure, contains_error_marker, first_error_line, FailureType, TIMEOUT_MARKER};

/// What one client invocation produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// `None` when the process was killed or died on a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        ExecOutput {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        ExecOutput {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn timeout(after: Duration) -> Self {
        ExecOutput {
            exit_code: None,
            stderr: format!("{} {}s", TIMEOUT_MARKER, after.as_secs()),
            timed_out: true,
            ..Default::default()
        }
    }

    /// Both channels have to agree: a zero exit status is not enough when the
    /// client printed a vendor error code to stdout.
    pub fn ok(&self) -> bool {
        !self.timed_out
            && self.exit_code == Some(0)
            && !contains_error_marker(&self.stdout)
            && !contains_error_marker(&self.stderr)
    }

    /// Best description of what went wrong, if anything did.
    pub fn error_text(&self) -> Option<String> {
        if self.ok() {
            return None;
        }
        let text = first_error_line(&self.stderr)
            .or_else(|| first_error_line(&self.stdout))
            .map(str::to_string)
            .or_else(|| {
                let stderr = self.stderr.trim();
                (!stderr.is_empty()).then(|| stderr.to_string())
            })
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("client exited with status {}", code),
                None => "client terminated by signal".to_string(),
            });
        Some(text)
    }

    pub fn outcome(&self) -> StatementOutcome {
        match self.error_text() {
            None => StatementOutcome::Applied,
            Some(message) => StatementOutcome::from_error(message),
        }
    }
}

/// Result of one statement, with "already exists" and "not found" split out
/// so callers do not have to string-match error text themselves.
#[derive(Debug, Clone, PartialEq, Eq, EnumKind)]
#[enum_kind(OutcomeKind, derive(Hash))]
pub enum StatementOutcome {
    Applied,
    AlreadyExists(String),
    NotFound(String),
    Failed { failure: FailureType, message: String },
}

impl StatementOutcome {
    pub fn from_error(message: String) -> Self {
        match classify_failure(&message) {
            FailureType::AlreadyExists => StatementOutcome::AlreadyExists(message),
            FailureType::NotFound => StatementOutcome::NotFound(message),
            failure => StatementOutcome::Failed { failure, message },
        }
    }

    pub fn failure_type(&self) -> Option<FailureType> {
        match self {
            StatementOutcome::Applied => None,
            StatementOutcome::AlreadyExists(_) => Some(FailureType::AlreadyExists),
            StatementOutcome::NotFound(_) => Some(FailureType::NotFound),
            StatementOutcome::Failed { failure, .. } => Some(*failure),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StatementOutcome::Applied => "",
            StatementOutcome::AlreadyExists(m) | StatementOutcome::NotFound(m) => m,
            StatementOutcome::Failed { message, .. } => message,
        }
    }
}

/// Anything that can run SQL text against the target.
///
/// Every call is an independent session: session state such as
/// `CURRENT_SCHEMA` does not survive from one call to the next.
pub trait SqlExecutor {
    /// Runs `sql`, giving up after `timeout`. An `Err` means the client could
    /// not be run at all; SQL errors come back inside `ExecOutput`.
    fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecOutput>;
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for &T {
    fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecOutput> {
        (**self).execute(sql, timeout)
    }
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for Box<T> {
    fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecOutput> {
        (**self).execute(sql, timeout)
    }
}

/// Runs SQL through the `obclient` command-line client (`<program> <args> -e <sql>`).
#[derive(Debug, Clone)]
pub struct ObClientExecutor {
    program: String,
    args: Vec<String>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);
// How long to wait for output once the client has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

impl ObClientExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        ObClientExecutor {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

// A descendant of the client can keep the pipe open after the client is gone,
// so the reader reports through a channel instead of being joined.
fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

impl SqlExecutor for ObClientExecutor {
    fn execute(&self, sql: &str, timeout: Duration) -> Result<ExecOutput> {
        let client_err = |source| FixupError::Client {
            program: self.program.clone(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("-e")
            .arg(sql)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(client_err)?;

        // Readers run on their own threads so a full pipe cannot stall the child
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(client_err)? {
                break Some(status);
            }
            if started.elapsed() >= timeout {
                warn!(timeout_secs = timeout.as_secs(), "statement timed out, killing client");
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let Some(status) = status else {
            return Ok(ExecOutput::timeout(timeout));
        };
        let stdout = stdout.recv_timeout(DRAIN_GRACE).unwrap_or_default();
        let stderr = stderr.recv_timeout(DRAIN_GRACE).unwrap_or_default();
        debug!(exit = ?status.code(), elapsed_ms = started.elapsed().as_millis() as u64, "client finished");
        Ok(ExecOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out: false,
        })
    }
}

/// Runs a query and splits its tab-separated output into rows.
pub fn query_rows<E: SqlExecutor + ?Sized>(executor: &E, sql: &str, timeout: Duration) -> Result<Vec<Vec<String>>> {
    let output = executor.execute(sql, timeout)?;
    if let Some(message) = output.error_text() {
        return Err(FixupError::Query(message));
    }
    Ok(output
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').map(|cell| cell.trim().to_string()).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_exit_with_error_in_stdout_is_a_failure() {
        let output = ExecOutput::success("ORA-00900: invalid SQL statement\n");
        assert!(!output.ok());
        assert_eq!(output.error_text().as_deref(), Some("ORA-00900: invalid SQL statement"));
        assert_eq!(OutcomeKind::from(&output.outcome()), OutcomeKind::Failed);
        assert_eq!(output.outcome().failure_type(), Some(FailureType::Syntax));
    }

    #[test]
    fn test_outcome_variants() {
        assert_eq!(ExecOutput::success("Query OK").outcome(), StatementOutcome::Applied);
        let exists = ExecOutput::failure(1, "ORA-00955: name is already used by an existing object");
        assert_eq!(OutcomeKind::from(&exists.outcome()), OutcomeKind::AlreadyExists);
        let missing = ExecOutput::failure(1, "ORA-00942: table or view does not exist");
        assert_eq!(OutcomeKind::from(&missing.outcome()), OutcomeKind::NotFound);
        let timeout = ExecOutput::timeout(Duration::from_secs(3));
        assert_eq!(timeout.outcome().failure_type(), Some(FailureType::ExecutionTimeout));
    }

    #[test]
    fn test_nonzero_exit_without_message() {
        let output = ExecOutput::failure(2, "");
        assert_eq!(output.error_text().as_deref(), Some("client exited with status 2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_obclient_executor_runs_a_process() {
        // `sh -c <script> -e <sql>` runs the script with `-e` and the SQL as $0/$1
        let executor = ObClientExecutor::new("sh", vec!["-c".to_string(), "printf 'A\\tB\\n'".to_string()]);
        let rows = query_rows(&executor, "SELECT 1 FROM dual", Duration::from_secs(10)).unwrap();
        assert_eq!(rows, vec![vec!["A".to_string(), "B".to_string()]]);
    }

    #[cfg(unix)]
    #[test]
    fn test_obclient_executor_times_out() {
        let executor = ObClientExecutor::new("sh", vec!["-c".to_string(), "sleep 5".to_string()]);
        let output = executor.execute("SELECT 1 FROM dual", Duration::from_millis(100)).unwrap();
        assert!(output.timed_out);
        assert!(!output.ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_is_not_held_up_by_a_background_child() {
        // the backgrounded sleep inherits stdout and outlives the killed shell
        let executor = ObClientExecutor::new("sh", vec!["-c".to_string(), "sleep 5 & sleep 5".to_string()]);
        let started = Instant::now();
        let output = executor.execute("SELECT 1 FROM dual", Duration::from_millis(100)).unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let executor = ObClientExecutor::new("/nonexistent/obclient", vec![]);
        assert!(matches!(
            executor.execute("SELECT 1 FROM dual", Duration::from_secs(1)),
            Err(FixupError::Client { .. })
        ));
    }
}

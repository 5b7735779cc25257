//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use ob_fixup_run::{ExecOutput, FixupConfig, Result, SqlExecutor};

struct Rule {
    needle: String,
    stdout: String,
    once: bool,
}

/// Executor that answers from a list of `(needle, stdout)` rules and records
/// every SQL text it receives. The first rule whose needle occurs in the SQL
/// wins; anything else succeeds with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, needle: &str, stdout: &str) -> Self {
        self.push_rule(needle, stdout, false)
    }

    /// Rule that is dropped after its first match.
    pub fn answer_once(self, needle: &str, stdout: &str) -> Self {
        self.push_rule(needle, stdout, true)
    }

    fn push_rule(self, needle: &str, stdout: &str, once: bool) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            stdout: stdout.to_string(),
            once,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that were not dictionary queries.
    pub fn statements(&self) -> Vec<String> {
        self.calls().into_iter().filter(|sql| !sql.starts_with("SELECT")).collect()
    }
}

impl SqlExecutor for ScriptedExecutor {
    fn execute(&self, sql: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.calls.lock().unwrap().push(sql.to_string());
        let mut rules = self.rules.lock().unwrap();
        if let Some(index) = rules.iter().position(|r| sql.contains(r.needle.as_str())) {
            let stdout = rules[index].stdout.clone();
            if rules[index].once {
                rules.remove(index);
            }
            return Ok(ExecOutput::success(stdout));
        }
        Ok(ExecOutput::success(""))
    }
}

/// A fixup tree in a temporary directory.
pub struct Fixture {
    pub root: PathBuf,
    dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fixup_scripts");
        fs::create_dir_all(&root).unwrap();
        Fixture { root, dir }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, sql: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, sql).unwrap();
        path
    }

    pub fn config(&self) -> FixupConfig {
        let mut config = FixupConfig::default();
        config.fixup.root = self.root.clone();
        config.view_chain.report_dir = self.base().join("main_reports");
        config
    }
}

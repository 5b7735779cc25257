use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::FixupConfig;
use crate::executor::SqlExecutor;
use crate::failure::FailureType;

/// Counters accumulated over a whole run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunCounters {
    pub statements_run: usize,
    pub statement_failures: usize,
    pub already_existing: usize,
    pub scripts_archived: usize,
    pub grants_injected: usize,
    pub recompiled: usize,
}

/// State shared by every stage of one run: configuration, the executor
/// handle, counters, and what earlier rounds learned about individual scripts.
pub struct RunContext<E: SqlExecutor> {
    pub config: FixupConfig,
    pub executor: E,
    pub counters: RunCounters,
    /// Scripts whose last failure will not go away by retrying.
    pub not_retried: HashMap<PathBuf, FailureType>,
    /// Scripts with no statements; they are skipped and never counted as work left.
    pub empty_scripts: HashSet<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl<E: SqlExecutor> RunContext<E> {
    pub fn new(config: FixupConfig, executor: E) -> Self {
        RunContext {
            config,
            executor,
            counters: RunCounters::default(),
            not_retried: HashMap::new(),
            empty_scripts: HashSet::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the run at the next round boundary when set.
    /// A script that is already executing always runs to completion.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

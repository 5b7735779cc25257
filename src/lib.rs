//! Applies comparator-generated fixup scripts to an OceanBase (Oracle mode)
//! target in dependency order, round after round, until nothing is left.

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod failure;
pub mod grants;
pub mod graph;
pub mod objects;
pub mod parser;
pub mod plan;
pub mod recompile;
pub mod report;
pub mod scheduler;
pub mod statements;
pub mod target;
pub mod view_chain;

pub use config::FixupConfig;
pub use context::RunContext;
pub use engine::{run_iterative_fixup, FixupOutcome};
pub use error::{FixupError, Result};
pub use executor::{ExecOutput, ObClientExecutor, SqlExecutor};

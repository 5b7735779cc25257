use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixupError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory walk failed: {0}")]
    Walk(#[from] ignore::Error),

    #[error("invalid search pattern: {0}")]
    Pattern(#[from] grep::regex::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("sql client `{program}` failed: {source}")]
    Client {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("query failed: {0}")]
    Query(String),

    #[error("malformed report {path}: {reason}")]
    Report {
        path: PathBuf,
        reason: String,
    },

    #[error("no report matching `{prefix}` under {dir}")]
    ReportNotFound {
        dir: PathBuf,
        prefix: String,
    },
}

impl FixupError {
    /// Wraps an `io::Error` with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FixupError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FixupError>;

//! Classification of raw SQL error text.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Closed taxonomy of statement failures. Decides whether a script is worth
/// running again in a later round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureType {
    LockTimeout,
    Deadlock,
    AuthFailed,
    ConnectionTimeout,
    ResourceExhausted,
    SnapshotError,
    /// The statement ran past the per-statement timeout.
    ExecutionTimeout,
    AlreadyExists,
    NotFound,
    Privilege,
    Constraint,
    Metadata,
    Syntax,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::LockTimeout => "LOCK_TIMEOUT",
            FailureType::Deadlock => "DEADLOCK",
            FailureType::AuthFailed => "AUTH_FAILED",
            FailureType::ConnectionTimeout => "CONNECTION_TIMEOUT",
            FailureType::ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailureType::SnapshotError => "SNAPSHOT_ERROR",
            FailureType::ExecutionTimeout => "EXECUTION_TIMEOUT",
            FailureType::AlreadyExists => "ALREADY_EXISTS",
            FailureType::NotFound => "NOT_FOUND",
            FailureType::Privilege => "PRIVILEGE",
            FailureType::Constraint => "CONSTRAINT",
            FailureType::Metadata => "METADATA",
            FailureType::Syntax => "SYNTAX",
            FailureType::Unknown => "UNKNOWN",
        }
    }

    /// Whether running the same script again later can succeed without the
    /// script itself changing.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureType::AuthFailed | FailureType::Syntax | FailureType::Constraint | FailureType::AlreadyExists
        )
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix the executor uses when it kills a statement that ran too long.
pub const TIMEOUT_MARKER: &str = "execution timed out after";

// Checked in order; the first class with a matching pattern wins.
const PATTERNS: &[(FailureType, &[&str])] = &[
    (FailureType::ExecutionTimeout, &[TIMEOUT_MARKER]),
    (
        FailureType::AuthFailed,
        &["ora-01017", "ora-28000", "ora-01045", "access denied for user", "error 1045"],
    ),
    (FailureType::Deadlock, &["ora-00060", "deadlock"]),
    (
        FailureType::LockTimeout,
        &["ora-30006", "ora-00054", "lock wait timeout", "resource busy", "error 1205"],
    ),
    (FailureType::SnapshotError, &["ora-01555", "ora-08176", "snapshot too old"]),
    (
        FailureType::ResourceExhausted,
        &[
            "ora-04030",
            "ora-04031",
            "ora-01652",
            "ora-01653",
            "ora-00018",
            "ora-00020",
            "over tenant memory",
            "out of memory",
            "no memory",
            "too many connections",
        ],
    ),
    (
        FailureType::ConnectionTimeout,
        &[
            "ora-12170",
            "ora-03113",
            "ora-03114",
            "ora-12541",
            "error 2002",
            "error 2003",
            "error 2013",
            "lost connection",
            "can't connect",
            "connection timed out",
            "connection refused",
        ],
    ),
    (
        FailureType::AlreadyExists,
        &[
            "ora-00955",
            "ora-01430",
            "ora-01408",
            "ora-02260",
            "ora-02261",
            "ora-02264",
            "ora-02275",
            "ora-01920",
            "ora-01921",
            "already exists",
            "is already used by an existing object",
        ],
    ),
    (
        FailureType::NotFound,
        &[
            "ora-00942",
            "ora-04043",
            "ora-01917",
            "ora-01918",
            "ora-02289",
            "ora-01434",
            "ora-04080",
            "does not exist",
            "doesn't exist",
            "unknown table",
        ],
    ),
    (
        FailureType::Privilege,
        &["ora-01031", "ora-01720", "ora-01927", "ora-01749", "insufficient privileges"],
    ),
    (
        FailureType::Constraint,
        &[
            "ora-00001",
            "ora-01400",
            "ora-01452",
            "ora-02291",
            "ora-02292",
            "ora-02298",
            "ora-02299",
            "ora-02437",
        ],
    ),
    (
        FailureType::Metadata,
        &[
            "ora-00904",
            "ora-00980",
            "ora-01775",
            "ora-04063",
            "ora-06575",
            "ora-24344",
            "invalid identifier",
            "compilation error",
        ],
    ),
    (
        FailureType::Syntax,
        &[
            "ora-00900",
            "ora-00901",
            "ora-00902",
            "ora-00903",
            "ora-00905",
            "ora-00906",
            "ora-00907",
            "ora-00911",
            "ora-00917",
            "ora-00921",
            "ora-00922",
            "ora-00923",
            "ora-00933",
            "ora-00936",
            "pls-00103",
            "syntax error",
            "error in your sql syntax",
        ],
    ),
];

/// Maps raw error text (stderr, or stdout carrying an error) to a class.
pub fn classify_failure(message: &str) -> FailureType {
    let lowered = message.to_lowercase();
    PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lowered.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(FailureType::Unknown)
}

fn error_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:\b(?:ORA|PLS|OBE)-\d{5}\b|^\s*ERROR(?:\s+\d+|\s+at\s+line|:|-\d+))").unwrap()
    })
}

/// True when `text` carries a vendor error code, even if the client exited 0.
pub fn contains_error_marker(text: &str) -> bool {
    error_marker().is_match(text)
}

/// The first line of `text` that carries an error marker.
pub fn first_error_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| contains_error_marker(line))
}

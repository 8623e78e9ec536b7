//! Error taxonomy for the migration engine.
//!
//! Every failure the engine can return is a [`MigrationError`]. Each variant
//! maps onto a stable [`ErrorCode`] so the CLI (and any embedding
//! application) can report a category, a code and a remediation hint without
//! string matching.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Boxed driver error carried as the source of SQL and probe failures.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the engine.
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalid,
    UnsupportedDialect,
    ProbeFailed,
    InvalidVersionState,
    AheadOfTarget,
    SchemaCorrupted,
    MissingMigration,
    StepFailed,
    TransformFailed,
    RewriteFailed,
    StatementFailed,
    ScriptMissing,
    ScriptUnreadable,
    RowDecode,
    InvalidIpRange,
    Timeout,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "E1001",
            Self::UnsupportedDialect => "E1002",
            Self::ProbeFailed => "E2001",
            Self::InvalidVersionState => "E2002",
            Self::AheadOfTarget => "E2003",
            Self::SchemaCorrupted => "E2004",
            Self::MissingMigration => "E2005",
            Self::StepFailed => "E3001",
            Self::TransformFailed => "E3002",
            Self::RewriteFailed => "E3003",
            Self::StatementFailed => "E4001",
            Self::ScriptMissing => "E4002",
            Self::ScriptUnreadable => "E4003",
            Self::RowDecode => "E4004",
            Self::InvalidIpRange => "E4005",
            Self::Timeout => "E5001",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Taxonomy category reported next to the code.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match self {
            Self::ConfigInvalid | Self::UnsupportedDialect => "ConfigError",
            Self::ProbeFailed => "ProbeError",
            Self::InvalidVersionState => "InvalidVersionState",
            Self::AheadOfTarget => "AheadOfTarget",
            Self::SchemaCorrupted => "Corrupted",
            Self::MissingMigration => "MissingMigration",
            Self::StepFailed => "StepFailure",
            Self::TransformFailed => "TransformFailure",
            Self::RewriteFailed => "RewriteFailure",
            Self::StatementFailed | Self::RowDecode | Self::InvalidIpRange => "DatabaseError",
            Self::ScriptMissing | Self::ScriptUnreadable => "ResourceError",
            Self::Timeout => "Timeout",
            Self::LockContention => "LockError",
            Self::InternalUnexpected => "Internal",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Invalid configuration",
            Self::UnsupportedDialect => "Unsupported SQL dialect",
            Self::ProbeFailed => "Catalog introspection failed",
            Self::InvalidVersionState => "Version table has an invalid row count",
            Self::AheadOfTarget => "Database is newer than this binary",
            Self::SchemaCorrupted => "Database layout is ambiguous",
            Self::MissingMigration => "No migration registered for a version transition",
            Self::StepFailed => "Migration step failed",
            Self::TransformFailed => "Legacy rule transform failed",
            Self::RewriteFailed => "Cross-reference rewrite failed",
            Self::StatementFailed => "SQL statement failed",
            Self::ScriptMissing => "SQL script not found",
            Self::ScriptUnreadable => "SQL script could not be read",
            Self::RowDecode => "Unexpected column value",
            Self::InvalidIpRange => "Unparseable IP or CIDR value",
            Self::Timeout => "Migration timed out",
            Self::LockContention => "Another migration holds the lock",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid => Some("Fix schemashift.toml or the command-line overrides and retry."),
            Self::UnsupportedDialect => Some("Use one of: sqlite3, mysql, postgres."),
            Self::ProbeFailed => Some("Check connectivity and that the user may read the catalog."),
            Self::InvalidVersionState => {
                Some("Leave exactly one row for this component in the database_version table.")
            }
            Self::AheadOfTarget => Some("Upgrade the application; downgrades are not supported."),
            Self::SchemaCorrupted => Some(
                "Prefixed tables exist without a version table. Inspect the database or restore a backup.",
            ),
            Self::MissingMigration => None,
            Self::StepFailed => Some("Fix the cause and re-run; completed steps are skipped."),
            Self::TransformFailed => {
                Some("The failing table was rolled back. Fix the row data and re-run.")
            }
            Self::RewriteFailed => Some("Re-run the migration to retry the affected boards."),
            Self::StatementFailed | Self::RowDecode => None,
            Self::ScriptMissing => Some("Point --sql-dir (or migration.sql_dir) at the SQL resources."),
            Self::ScriptUnreadable => Some("Check read permissions on the SQL resource directory."),
            Self::InvalidIpRange => Some("Correct or delete the offending ban row and re-run."),
            Self::Timeout => Some("Increase the timeout; the run can be resumed safely."),
            Self::LockContention => {
                Some("Wait for the other run to finish, or remove the lock file if it is stale.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors returned by the migration engine.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A dialect name did not parse.
    #[error("unsupported dialect {0:?}")]
    UnsupportedDialect(String),

    /// Catalog introspection failed for a reason other than absence.
    #[error("probing {object} failed: {source}")]
    Probe {
        /// `table` or `table.column` being probed.
        object: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// The version table exists but does not hold exactly one row.
    #[error("database_version has {rows} rows for component {component:?}, expected exactly 1")]
    InvalidVersion { component: String, rows: usize },

    /// The database reports a version newer than the target.
    #[error("database is at version {found}, newer than target version {target}")]
    AheadOfTarget { found: u32, target: u32 },

    /// Prefixed tables exist but there is no version table.
    #[error("database has {prefix:?}-prefixed tables but no version table: {detail}")]
    Corrupted { prefix: String, detail: String },

    /// No migration is registered for a transition on the required path.
    #[error("no migration registered from version {from} to version {}", .from + 1)]
    MissingMigration { from: u32 },

    /// A migration step failed; completed steps stay committed.
    #[error("step {step} failed: {source}")]
    StepFailure {
        step: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// A step panicked; recovered at the sequence boundary.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Transforming one legacy table failed; its batch was rolled back.
    #[error("transforming legacy table {table} failed: {source}")]
    TransformFailure {
        table: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// Rewriting cross-references for one board failed.
    #[error("rewriting references for board {board_id} failed: {source}")]
    RewriteFailure {
        board_id: i64,
        #[source]
        source: Box<MigrationError>,
    },

    /// A statement failed; the statement text is kept for context.
    #[error("statement failed: {statement}: {source}")]
    Sql {
        statement: String,
        #[source]
        source: BackendError,
    },

    /// A query that must return a row returned none.
    #[error("statement returned no rows: {statement}")]
    NoRows { statement: String },

    /// A column value did not have the expected shape.
    #[error("column {index}: expected {expected}, found {found}")]
    Decode {
        index: usize,
        expected: &'static str,
        found: String,
    },

    /// A ban address could not be parsed as an IP or CIDR range.
    #[error("invalid IP range {0:?}")]
    InvalidIpRange(String),

    /// A required SQL script was not found in any resource directory.
    #[error("SQL script {name} not found (searched {})", display_paths(.searched))]
    MissingScript { name: String, searched: Vec<PathBuf> },

    /// A SQL script was found but could not be read.
    #[error("failed to read SQL script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The overall deadline passed before the next statement.
    #[error("migration timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the run.
    #[error("migration cancelled")]
    Cancelled,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl MigrationError {
    /// Wrap a driver error with the statement that produced it.
    pub fn sql(statement: impl Into<String>, source: impl Into<BackendError>) -> Self {
        Self::Sql {
            statement: statement.into(),
            source: source.into(),
        }
    }

    /// Return the machine-readable error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedDialect(_) => ErrorCode::UnsupportedDialect,
            Self::Probe { .. } => ErrorCode::ProbeFailed,
            Self::InvalidVersion { .. } => ErrorCode::InvalidVersionState,
            Self::AheadOfTarget { .. } => ErrorCode::AheadOfTarget,
            Self::Corrupted { .. } => ErrorCode::SchemaCorrupted,
            Self::MissingMigration { .. } => ErrorCode::MissingMigration,
            Self::StepFailure { .. } => ErrorCode::StepFailed,
            Self::Panicked(_) => ErrorCode::InternalUnexpected,
            Self::TransformFailure { .. } => ErrorCode::TransformFailed,
            Self::RewriteFailure { .. } => ErrorCode::RewriteFailed,
            Self::Sql { .. } | Self::NoRows { .. } => ErrorCode::StatementFailed,
            Self::Decode { .. } => ErrorCode::RowDecode,
            Self::InvalidIpRange(_) => ErrorCode::InvalidIpRange,
            Self::MissingScript { .. } => ErrorCode::ScriptMissing,
            Self::Io { .. } => ErrorCode::ScriptUnreadable,
            Self::Timeout(_) | Self::Cancelled => ErrorCode::Timeout,
        }
    }

    /// Attribute this error to a named step.
    ///
    /// Timeouts and errors that already carry their own category pass
    /// through unchanged.
    #[must_use]
    pub fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            Self::StepFailure { .. }
            | Self::Probe { .. }
            | Self::TransformFailure { .. }
            | Self::Timeout(_)
            | Self::Cancelled => self,
            other => Self::StepFailure {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// True for timeout or cancellation, at any wrapping depth.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Cancelled => true,
            Self::Probe { source, .. }
            | Self::StepFailure { source, .. }
            | Self::TransformFailure { source, .. }
            | Self::RewriteFailure { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, MigrationError};
    use std::collections::HashSet;

    const ALL: [ErrorCode; 18] = [
        ErrorCode::ConfigInvalid,
        ErrorCode::UnsupportedDialect,
        ErrorCode::ProbeFailed,
        ErrorCode::InvalidVersionState,
        ErrorCode::AheadOfTarget,
        ErrorCode::SchemaCorrupted,
        ErrorCode::MissingMigration,
        ErrorCode::StepFailed,
        ErrorCode::TransformFailed,
        ErrorCode::RewriteFailed,
        ErrorCode::StatementFailed,
        ErrorCode::ScriptMissing,
        ErrorCode::ScriptUnreadable,
        ErrorCode::RowDecode,
        ErrorCode::InvalidIpRange,
        ErrorCode::Timeout,
        ErrorCode::LockContention,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let s = code.code();
            assert_eq!(s.len(), 5);
            assert!(s.starts_with('E'));
            assert!(s.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn in_step_wraps_plain_errors_once() {
        let err = MigrationError::NoRows {
            statement: "SELECT 1".into(),
        }
        .in_step("add posts.flag")
        .in_step("version 1 -> 2");
        match err {
            MigrationError::StepFailure { step, source } => {
                assert_eq!(step, "add posts.flag");
                assert!(matches!(*source, MigrationError::NoRows { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn probe_failures_keep_their_category() {
        let err = MigrationError::Probe {
            object: "gc_posts.ip".into(),
            source: Box::new(MigrationError::sql("SELECT DATA_TYPE", "gone away")),
        }
        .in_step("retype posts.ip");
        assert!(matches!(err, MigrationError::Probe { ref object, .. } if object == "gc_posts.ip"));
        assert_eq!(err.code(), ErrorCode::ProbeFailed);
    }

    #[test]
    fn timeouts_keep_their_category() {
        let err = MigrationError::Cancelled.in_step("anything");
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.code().category(), "Timeout");
    }

    #[test]
    fn nested_timeout_is_detected() {
        let err = MigrationError::RewriteFailure {
            board_id: 3,
            source: Box::new(MigrationError::Timeout(std::time::Duration::from_secs(1))),
        };
        assert!(err.is_timeout());
    }
}

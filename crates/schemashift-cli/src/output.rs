//! Human and JSON rendering shared by every command.
//!
//! Results go to stdout; errors go to stderr. In JSON mode an error is
//! wrapped as `{"error": {...}}` so callers can tell the two apart without
//! looking at the exit code.

use std::fmt;
use std::io::{self, Write};

use schemashift_core::{ErrorCode, MigrationError};
use serde::Serialize;

/// Output format selected by the global `--json` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    /// Returns `true` if JSON output was requested.
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// A failure reported to the operator: stable code, category, summary,
/// the concrete error text and an optional remediation hint.
#[derive(Debug, Clone, Serialize)]
pub struct CliError {
    pub code: &'static str,
    pub category: &'static str,
    pub message: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

impl CliError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            category: code.category(),
            message: code.message(),
            detail: detail.into(),
            hint: code.hint(),
        }
    }
}

impl From<&MigrationError> for CliError {
    fn from(err: &MigrationError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.category, self.detail)
    }
}

impl std::error::Error for CliError {}

/// Map any command failure onto a [`CliError`].
pub fn classify(err: &anyhow::Error) -> CliError {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.clone();
    }
    if let Some(migration) = err.downcast_ref::<MigrationError>() {
        return CliError::from(migration);
    }
    CliError::new(ErrorCode::InternalUnexpected, format!("{err:#}"))
}

/// Render a serializable value to stdout in the requested format.
///
/// In JSON mode the value is serialized with `serde_json`; otherwise
/// `human_fn` writes the text output.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, &mut out)?,
    }
    Ok(())
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    write_error(mode, error, &mut out)
}

fn write_error(mode: OutputMode, error: &CliError, out: &mut dyn Write) -> anyhow::Result<()> {
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut *out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            writeln!(out, "error[{}] {}: {}", error.code, error.category, error.message)?;
            writeln!(out, "  {}", error.detail)?;
            if let Some(hint) = error.hint {
                writeln!(out, "  hint: {hint}")?;
            }
        }
    }
    Ok(())
}

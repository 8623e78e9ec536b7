//! SQL resource scripts: lookup across resource directories and statement
//! splitting.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::db::Session;
use crate::dialect::Dialect;
use crate::error::{MigrationError, Result};

/// Default installation directories searched after the primary directory.
pub const DEFAULT_FALLBACK_DIRS: [&str; 2] = ["/usr/local/share/schemashift", "/usr/share/schemashift"];

/// Current schema, used for fresh installs and the filter-table step.
#[must_use]
pub fn init_script(dialect: Dialect) -> String {
    format!("initdb_{dialect}.sql")
}

/// Version-1 schema recreated when rebuilding a pre-versioning database.
#[must_use]
pub fn preversioning_init_script(dialect: Dialect) -> String {
    format!("preversioning/initdb_{dialect}.sql")
}

/// Bulk copy from the renamed `_old` tables into the version-1 schema.
#[must_use]
pub fn preversioning_data_script(dialect: Dialect) -> String {
    format!("preversioning/oldDBMigration_{dialect}.sql")
}

/// Locates SQL scripts by logical name.
///
/// The primary directory wins; fallbacks are tried in order.
#[derive(Debug, Clone)]
pub struct ScriptLoader {
    primary: PathBuf,
    fallbacks: Vec<PathBuf>,
}

impl Default for ScriptLoader {
    fn default() -> Self {
        Self::new(
            "sql",
            DEFAULT_FALLBACK_DIRS.iter().map(PathBuf::from).collect(),
        )
    }
}

impl ScriptLoader {
    #[must_use]
    pub fn new(primary: impl Into<PathBuf>, fallbacks: Vec<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
        }
    }

    /// Directories in search order.
    pub fn search_dirs(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.primary.as_path()).chain(self.fallbacks.iter().map(PathBuf::as_path))
    }

    /// First existing file for `name`.
    #[must_use]
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.search_dirs()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Read the script called `name`.
    ///
    /// # Errors
    ///
    /// [`MigrationError::MissingScript`] if no directory has it, or
    /// [`MigrationError::Io`] if it cannot be read.
    pub fn load(&self, name: &str) -> Result<String> {
        let path = self.locate(name).ok_or_else(|| MigrationError::MissingScript {
            name: name.to_string(),
            searched: self.search_dirs().map(Path::to_path_buf).collect(),
        })?;
        debug!(script = name, path = %path.display(), "loading SQL script");
        std::fs::read_to_string(&path).map_err(|source| MigrationError::Io { path, source })
    }

    /// Load `name` and split it into statements.
    ///
    /// # Errors
    ///
    /// As [`Self::load`].
    pub fn statements(&self, name: &str) -> Result<Vec<String>> {
        Ok(split_statements(&self.load(name)?))
    }

    /// Execute every statement of `name` in order.
    ///
    /// # Errors
    ///
    /// As [`Self::load`], or the first failing statement.
    pub fn run(&self, session: &Session<'_>, name: &str) -> Result<usize> {
        let statements = self.statements(name)?;
        for statement in &statements {
            session.exec(statement, &[])?;
        }
        debug!(script = name, statements = statements.len(), "ran SQL script");
        Ok(statements.len())
    }
}

/// Split a script into statements.
///
/// `--` comments are dropped and `;` terminates a statement, except inside
/// single- or double-quoted text. Blank statements are skipped.
#[must_use]
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            break;
                        }
                    }
                    current.push(' ');
                }
                ';' => push_statement(&mut statements, &mut current),
                _ => current.push(c),
            },
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

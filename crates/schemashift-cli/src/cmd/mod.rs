pub mod migrate;
pub mod status;

use std::path::{Path, PathBuf};

use schemashift_core::config::{Config, resolve_config};
use schemashift_core::{Dialect, ErrorCode, Session, SqliteBackend};

use crate::output::CliError;

/// Connection settings given on the command line. Each one overrides the
/// matching config file value.
#[derive(Debug, Clone, Default)]
pub struct ConnectionArgs {
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub dialect: Option<Dialect>,
    pub prefix: Option<String>,
}

impl ConnectionArgs {
    /// Resolve the config file and apply the overrides.
    pub fn load(&self, working_dir: &Path) -> Result<Config, CliError> {
        let mut config = resolve_config(self.config.as_deref(), working_dir)
            .map_err(|err| CliError::new(ErrorCode::ConfigInvalid, format!("{err:#}")))?;
        if let Some(path) = &self.database {
            config.database.path = Some(path.clone());
        }
        if let Some(dialect) = self.dialect {
            config.database.dialect = dialect;
        }
        if let Some(prefix) = &self.prefix {
            config.database.prefix.clone_from(prefix);
        }
        Ok(config)
    }
}

/// The SQLite file this binary will open, relative paths taken from
/// `working_dir`.
///
/// MySQL and Postgres are reachable only through an embedding application's
/// own `Backend`.
pub fn sqlite_path(config: &Config, working_dir: &Path) -> Result<PathBuf, CliError> {
    let dialect = config.database.dialect;
    if dialect != Dialect::Sqlite {
        return Err(CliError::new(
            ErrorCode::UnsupportedDialect,
            format!("this binary ships only the sqlite3 driver, not {dialect}"),
        ));
    }
    let path = config.database.path.as_ref().ok_or_else(|| {
        CliError::new(
            ErrorCode::ConfigInvalid,
            "no database file; pass --database or set database.path",
        )
    })?;
    Ok(working_dir.join(path))
}

pub fn open_sqlite(path: &Path) -> Result<SqliteBackend, CliError> {
    SqliteBackend::open(path).map_err(|err| CliError::new(ErrorCode::ConfigInvalid, format!("{err:#}")))
}

/// A session carrying the configured prefix and schema name.
pub fn session_for<'a>(backend: &'a SqliteBackend, config: &Config) -> Session<'a> {
    Session::new(backend, config.database.dialect)
        .with_prefix(config.database.prefix.clone())
        .with_schema(config.database.name.clone())
}

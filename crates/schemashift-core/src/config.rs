//! `schemashift.toml` loading and resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::oracle::DEFAULT_COMPONENT;
use crate::orchestrator::{LATEST_VERSION, MigrationOptions};
use crate::scripts::{DEFAULT_FALLBACK_DIRS, ScriptLoader};

/// File looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "schemashift.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_dialect")]
    pub dialect: Dialect,
    /// Schema name for MySQL/Postgres catalog queries.
    #[serde(default)]
    pub name: String,
    /// SQLite database file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Replaces the `DBPREFIX` token in table names.
    #[serde(default)]
    pub prefix: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            name: String::new(),
            path: None,
            prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default = "default_target_version")]
    pub target_version: u32,
    #[serde(default = "default_true")]
    pub drop_legacy_tables: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_sql_dir")]
    pub sql_dir: PathBuf,
    #[serde(default = "default_fallback_dirs")]
    pub fallback_dirs: Vec<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            component: default_component(),
            target_version: default_target_version(),
            drop_legacy_tables: default_true(),
            timeout_secs: None,
            sql_dir: default_sql_dir(),
            fallback_dirs: default_fallback_dirs(),
        }
    }
}

impl MigrationConfig {
    #[must_use]
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            component: self.component.clone(),
            target_version: self.target_version,
            drop_legacy_tables: self.drop_legacy_tables,
        }
    }

    #[must_use]
    pub fn script_loader(&self) -> ScriptLoader {
        ScriptLoader::new(self.sql_dir.clone(), self.fallback_dirs.clone())
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

const fn default_dialect() -> Dialect {
    Dialect::Sqlite
}

fn default_component() -> String {
    DEFAULT_COMPONENT.to_string()
}

const fn default_target_version() -> u32 {
    LATEST_VERSION
}

const fn default_true() -> bool {
    true
}

fn default_sql_dir() -> PathBuf {
    PathBuf::from("sql")
}

fn default_fallback_dirs() -> Vec<PathBuf> {
    DEFAULT_FALLBACK_DIRS.iter().map(PathBuf::from).collect()
}

/// Parse one config file.
///
/// # Errors
///
/// The file cannot be read or is not valid TOML for [`Config`].
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str::<Config>(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve the configuration for a run.
///
/// An explicit path must exist. Otherwise `./schemashift.toml`, then
/// `<config dir>/schemashift/config.toml`, then built-in defaults.
///
/// # Errors
///
/// The explicit file is missing, or a found file does not parse.
pub fn resolve_config(explicit: Option<&Path>, working_dir: &Path) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let candidates = std::iter::once(working_dir.join(CONFIG_FILE_NAME))
        .chain(dirs::config_dir().map(|dir| dir.join("schemashift").join("config.toml")));
    for candidate in candidates {
        if candidate.is_file() {
            return load_config(&candidate);
        }
    }
    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.migration.target_version, LATEST_VERSION);
        assert!(config.migration.drop_legacy_tables);
        assert_eq!(config.migration.component, "main");
        assert_eq!(config.database.dialect, Dialect::Sqlite);
    }

    #[test]
    fn parses_every_section() {
        let config: Config = toml::from_str(
            r#"
            [database]
            dialect = "postgres"
            name = "board"
            prefix = "gc_"

            [migration]
            target_version = 3
            drop_legacy_tables = false
            timeout_secs = 30
            sql_dir = "/opt/sql"
            fallback_dirs = []
            "#,
        )
        .expect("parse");
        assert_eq!(config.database.dialect, Dialect::Postgres);
        assert_eq!(config.database.prefix, "gc_");
        assert_eq!(config.migration.timeout(), Some(Duration::from_secs(30)));
        let options = config.migration.options();
        assert_eq!(options.target_version, 3);
        assert!(!options.drop_legacy_tables);
        assert_eq!(
            config.migration.script_loader().search_dirs().collect::<Vec<_>>(),
            vec![Path::new("/opt/sql")]
        );
    }

    #[test]
    fn sqlite_alias_is_accepted() {
        let config: Config = toml::from_str("[database]\ndialect = \"sqlite\"").expect("parse");
        assert_eq!(config.database.dialect, Dialect::Sqlite);
    }

    #[test]
    fn unknown_dialect_is_rejected() {
        assert!(toml::from_str::<Config>("[database]\ndialect = \"oracle\"").is_err());
    }

    #[test]
    fn working_directory_file_is_found() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[database]\nprefix = \"x_\"\n")
            .expect("write");
        let config = resolve_config(None, dir.path()).expect("resolve");
        assert_eq!(config.database.prefix, "x_");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = resolve_config(Some(&dir.path().join("nope.toml")), dir.path()).expect_err("missing");
        assert!(err.to_string().contains("Failed to read"));
    }
}

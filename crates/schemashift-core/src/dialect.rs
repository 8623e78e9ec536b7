//! SQL dialect identifiers and the per-dialect SQL fragments the engine needs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// The three supported SQL engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Mysql,
    Postgres,
    #[serde(rename = "sqlite3", alias = "sqlite")]
    Sqlite,
}

impl Dialect {
    /// Identifier used in config files and SQL script names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite3",
        }
    }

    /// Catalog query returning the declared type of `(table, column)`.
    ///
    /// Parameter order follows [`Self::column_type_params`].
    #[must_use]
    pub const fn column_type_query(self) -> &'static str {
        match self {
            Self::Mysql => {
                "SELECT DATA_TYPE FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE()) \
                 AND TABLE_NAME = ? AND COLUMN_NAME = ? LIMIT 1"
            }
            Self::Postgres => {
                "SELECT udt_name FROM information_schema.columns \
                 WHERE (table_schema = ? OR table_schema = 'public') \
                 AND table_name = ? AND column_name = ? LIMIT 1"
            }
            Self::Sqlite => "SELECT type FROM pragma_table_info(?) WHERE name = ?",
        }
    }

    /// Whether the column-type query takes the schema name as first parameter.
    #[must_use]
    pub const fn column_type_params(self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Catalog query counting tables named exactly `?`.
    #[must_use]
    pub const fn table_count_query(self) -> &'static str {
        match self {
            Self::Mysql => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
            }
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE table_catalog = CURRENT_DATABASE() AND table_name = ?"
            }
            Self::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE name = ? AND type = 'table'",
        }
    }

    /// Catalog query counting tables whose name matches a `LIKE` pattern.
    #[must_use]
    pub const fn table_like_query(self) -> &'static str {
        match self {
            Self::Mysql => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME LIKE ? ESCAPE '!'"
            }
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE table_catalog = CURRENT_DATABASE() AND table_name LIKE ? ESCAPE '!'"
            }
            Self::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE ? ESCAPE '!'"
            }
        }
    }

    /// `ALTER TABLE` renaming a column. MySQL restates the definition.
    #[must_use]
    pub fn rename_column_sql(self, table: &str, from: &str, to: &str, definition: &str) -> String {
        match self {
            Self::Mysql => format!("ALTER TABLE {table} CHANGE {from} {to} {definition}"),
            Self::Postgres | Self::Sqlite => {
                format!("ALTER TABLE {table} RENAME COLUMN {from} TO {to}")
            }
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite3" | "sqlite" => Ok(Self::Sqlite),
            other => Err(MigrationError::UnsupportedDialect(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("MySQL".parse::<Dialect>().ok(), Some(Dialect::Mysql));
        assert_eq!("postgresql".parse::<Dialect>().ok(), Some(Dialect::Postgres));
        assert_eq!("sqlite".parse::<Dialect>().ok(), Some(Dialect::Sqlite));
        assert!(matches!(
            "oracle".parse::<Dialect>(),
            Err(MigrationError::UnsupportedDialect(_))
        ));
    }

    #[test]
    fn display_matches_script_suffix() {
        assert_eq!(Dialect::Sqlite.to_string(), "sqlite3");
        assert_eq!(Dialect::Postgres.to_string(), "postgres");
    }

    #[test]
    fn serde_uses_config_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            dialect: Dialect,
        }
        let w: Wrapper = toml::from_str("dialect = \"sqlite3\"").expect("parse");
        assert_eq!(w.dialect, Dialect::Sqlite);
        let w: Wrapper = toml::from_str("dialect = \"postgres\"").expect("parse");
        assert_eq!(w.dialect, Dialect::Postgres);
    }

    #[test]
    fn mysql_rename_restates_definition() {
        assert_eq!(
            Dialect::Mysql.rename_column_sql("t", "a", "b", "BOOL NOT NULL DEFAULT FALSE"),
            "ALTER TABLE t CHANGE a b BOOL NOT NULL DEFAULT FALSE"
        );
        assert_eq!(
            Dialect::Sqlite.rename_column_sql("t", "a", "b", "ignored"),
            "ALTER TABLE t RENAME COLUMN a TO b"
        );
    }
}

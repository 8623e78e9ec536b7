//! [`Backend`] over a rusqlite connection.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};

use super::{Backend, Row, SqlValue, TIMESTAMP_FORMAT};
use crate::error::{MigrationError, Result};

/// Busy timeout applied to file-backed connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded single-file database backend.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    ///
    /// Foreign key enforcement is left at the SQLite default, so a
    /// pre-versioning rebuild can drop its legacy tables. Turning it on is
    /// one of the migration steps and lasts for this connection only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or configured.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("configure sqlite busy timeout")?;
        Ok(Self { conn })
    }

    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite database")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub const fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn into_inner(self) -> Connection {
        self.conn
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Float(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Timestamp(t) => Value::Text(t.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

impl Backend for SqliteBackend {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let values: Vec<Value> = params.iter().map(to_value).collect();
        let changed = self
            .conn
            .execute(sql, params_from_iter(values.iter()))
            .map_err(|e| MigrationError::sql(sql, e))?;
        Ok(u64::try_from(changed).unwrap_or(u64::MAX))
    }

    fn execute_unprepared(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| MigrationError::sql(sql, e))
    }

    fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        let values: Vec<Value> = params.iter().map(to_value).collect();
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| MigrationError::sql(sql, e))?;
        let width = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(|e| MigrationError::sql(sql, e))?;
        while let Some(row) = rows.next().map_err(|e| MigrationError::sql(sql, e))? {
            let mut decoded = Vec::with_capacity(width);
            for i in 0..width {
                let value = row.get_ref(i).map_err(|e| MigrationError::sql(sql, e))?;
                decoded.push(from_value_ref(value));
            }
            on_row(Row::new(decoded))?;
        }
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        self.execute_unprepared("BEGIN")
    }

    fn commit(&self) -> Result<()> {
        self.execute_unprepared("COMMIT")
    }

    fn rollback(&self) -> Result<()> {
        self.execute_unprepared("ROLLBACK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::db::Session;

    #[test]
    fn round_trips_values_through_sqlite() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite).with_prefix("gc_");
        session
            .exec(
                "CREATE TABLE DBPREFIXt(id INTEGER PRIMARY KEY, name TEXT, flag BOOL, at TIMESTAMP)",
                &[],
            )
            .expect("create");
        let at = crate::db::parse_timestamp("2021-06-01 10:00:00").expect("ts");
        session
            .exec(
                "INSERT INTO DBPREFIXt(name, flag, at) VALUES(?, ?, ?)",
                &["a".into(), true.into(), at.into()],
            )
            .expect("insert");

        let row = session
            .query_opt("SELECT id, name, flag, at FROM gc_t", &[])
            .expect("query")
            .expect("one row");
        assert_eq!(row.get_i64(0).expect("id"), 1);
        assert_eq!(row.get_string(1).expect("name"), "a");
        assert!(row.get_bool(2).expect("flag"));
        assert_eq!(row.get_timestamp(3).expect("at"), at);
    }

    #[test]
    fn errors_carry_statement_text() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let err = backend.execute("SELEC nonsense", &[]).expect_err("syntax");
        match err {
            MigrationError::Sql { statement, .. } => assert_eq!(statement, "SELEC nonsense"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("board.db");
        let backend = SqliteBackend::open(&path).expect("open file db");
        backend.execute_unprepared("CREATE TABLE x(a INT)").expect("ddl");
        assert!(path.exists());
    }

    #[test]
    fn rollback_discards_writes() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        session.exec("CREATE TABLE t(a INT)", &[]).expect("create");
        let result: Result<()> = session.transaction(|s| {
            s.exec("INSERT INTO t VALUES (1)", &[])?;
            s.exec("INSERT INTO missing VALUES (1)", &[])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(session.query_i64("SELECT COUNT(*) FROM t", &[]).expect("count"), 0);
    }
}

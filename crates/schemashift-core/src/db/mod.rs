//! Database access seam.
//!
//! The engine never talks to a driver directly. It goes through a
//! [`Backend`] (execute, query, transactions) wrapped in a [`Session`] that
//! applies the per-run conventions:
//! - every `DBPREFIX` token is replaced by the configured table prefix
//! - `?` placeholders are rebound to `$n` for Postgres
//! - the [`CancelToken`] is checked before each statement
//! - driver errors carry the statement text

#[cfg(test)]
pub(crate) mod fake;
pub mod sqlite;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::dialect::Dialect;
use crate::error::{MigrationError, Result};

pub use sqlite::SqliteBackend;

/// Token substituted with the configured table prefix.
pub const PREFIX_TOKEN: &str = "DBPREFIX";

/// Text layout used when a timestamp has to travel as a string.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A bound parameter or a fetched column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    fn describe(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Int(i) => format!("integer {i}"),
            Self::Float(f) => format!("real {f}"),
            Self::Text(s) => format!("text {s:?}"),
            Self::Blob(b) => format!("blob of {} bytes", b.len()),
            Self::Bool(b) => format!("bool {b}"),
            Self::Timestamp(t) => format!("timestamp {t}"),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One fetched row, decoded eagerly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    #[must_use]
    pub const fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the row has fewer columns.
    pub fn value(&self, index: usize) -> Result<&SqlValue> {
        self.values.get(index).ok_or_else(|| MigrationError::Decode {
            index,
            expected: "a column",
            found: format!("row of {} columns", self.values.len()),
        })
    }

    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the value is not an integer.
    pub fn get_i64(&self, index: usize) -> Result<i64> {
        self.get_opt_i64(index)?.ok_or_else(|| MigrationError::Decode {
            index,
            expected: "integer",
            found: "NULL".to_string(),
        })
    }

    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the value is neither NULL nor an integer.
    pub fn get_opt_i64(&self, index: usize) -> Result<Option<i64>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Int(i) => Ok(Some(*i)),
            SqlValue::Bool(b) => Ok(Some(i64::from(*b))),
            text @ SqlValue::Text(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| decode_error(index, "integer", text)),
            other => Err(decode_error(index, "integer", other)),
        }
    }

    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the value is NULL or not textual.
    pub fn get_string(&self, index: usize) -> Result<String> {
        self.get_opt_string(index)?.ok_or_else(|| MigrationError::Decode {
            index,
            expected: "text",
            found: "NULL".to_string(),
        })
    }

    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the value is not textual.
    pub fn get_opt_string(&self, index: usize) -> Result<Option<String>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Blob(b) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
            SqlValue::Int(i) => Ok(Some(i.to_string())),
            other => Err(decode_error(index, "text", other)),
        }
    }

    /// Booleans arrive as native bools, integers or `t`/`true` strings
    /// depending on the driver. NULL reads as `false`.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Decode`] for any other shape.
    pub fn get_bool(&self, index: usize) -> Result<bool> {
        match self.value(index)? {
            SqlValue::Null => Ok(false),
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(i) => Ok(*i != 0),
            SqlValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "t" | "true" | "y" | "yes" => Ok(true),
                "0" | "f" | "false" | "n" | "no" | "" => Ok(false),
                _ => Err(decode_error(index, "boolean", &SqlValue::Text(s.clone()))),
            },
            other => Err(decode_error(index, "boolean", other)),
        }
    }

    /// # Errors
    ///
    /// [`MigrationError::Decode`] if the value is NULL or not a timestamp.
    pub fn get_timestamp(&self, index: usize) -> Result<NaiveDateTime> {
        match self.value(index)? {
            SqlValue::Timestamp(t) => Ok(*t),
            SqlValue::Text(s) => parse_timestamp(s)
                .ok_or_else(|| decode_error(index, "timestamp", &SqlValue::Text(s.clone()))),
            other => Err(decode_error(index, "timestamp", other)),
        }
    }
}

fn decode_error(index: usize, expected: &'static str, found: &SqlValue) -> MigrationError {
    MigrationError::Decode {
        index,
        expected,
        found: found.describe(),
    }
}

/// Parse the textual timestamp layouts drivers hand back.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Generic SQL execution capability supplied by the embedding application.
///
/// Implementations receive fully prepared SQL: prefix substituted and
/// placeholders in the dialect's native syntax. They must attach the
/// statement text to errors via [`MigrationError::sql`].
pub trait Backend {
    /// Run a parameterized statement and return the affected row count.
    ///
    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`].
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a statement outside the prepared-statement protocol.
    ///
    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`].
    fn execute_unprepared(&self, sql: &str) -> Result<()>;

    /// Run a query, handing each row to `on_row` in order. An error from
    /// `on_row` stops iteration and is returned unchanged.
    ///
    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`], or the callback's error.
    fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()>;

    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`].
    fn begin(&self) -> Result<()>;

    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`].
    fn commit(&self) -> Result<()>;

    /// # Errors
    ///
    /// Driver failures as [`MigrationError::Sql`].
    fn rollback(&self) -> Result<()>;
}

/// A backend plus the conventions of one migration run.
pub struct Session<'a> {
    backend: &'a dyn Backend,
    dialect: Dialect,
    prefix: String,
    schema: String,
    cancel: CancelToken,
}

impl<'a> Session<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn Backend, dialect: Dialect) -> Self {
        Self {
            backend,
            dialect,
            prefix: String::new(),
            schema: String::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Table prefix substituted for [`PREFIX_TOKEN`].
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Database (schema) name used by MySQL/Postgres catalog queries.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Prefixed physical table name.
    #[must_use]
    pub fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.trim_start_matches(PREFIX_TOKEN))
    }

    /// Substitute the prefix token and rebind placeholders.
    #[must_use]
    pub fn prepare(&self, sql: &str) -> String {
        let sql = sql.replace(PREFIX_TOKEN, &self.prefix);
        match self.dialect {
            Dialect::Postgres => rebind_placeholders(&sql),
            Dialect::Mysql | Dialect::Sqlite => sql,
        }
    }

    /// Execute one statement.
    ///
    /// # Errors
    ///
    /// Timeout/cancellation, or the backend's statement error.
    pub fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.cancel.check()?;
        let sql = self.prepare(sql);
        debug!(statement = %sql, params = params.len(), "execute");
        self.backend.execute(&sql, params)
    }

    /// Execute one statement without preparing it (prefix still applies).
    ///
    /// # Errors
    ///
    /// Timeout/cancellation, or the backend's statement error.
    pub fn exec_unprepared(&self, sql: &str) -> Result<()> {
        self.cancel.check()?;
        let sql = sql.replace(PREFIX_TOKEN, &self.prefix);
        debug!(statement = %sql, "execute unprepared");
        self.backend.execute_unprepared(&sql)
    }

    /// Stream rows into `on_row`.
    ///
    /// # Errors
    ///
    /// Timeout/cancellation, the backend's statement error, or the
    /// callback's error.
    pub fn query_each(
        &self,
        sql: &str,
        params: &[SqlValue],
        mut on_row: impl FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        self.cancel.check()?;
        let sql = self.prepare(sql);
        debug!(statement = %sql, params = params.len(), "query");
        self.backend.query(&sql, params, &mut on_row)
    }

    /// Collect every row.
    ///
    /// # Errors
    ///
    /// As [`Self::query_each`].
    pub fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.query_each(sql, params, |row| {
            rows.push(row);
            Ok(())
        })?;
        Ok(rows)
    }

    /// First row, if any.
    ///
    /// # Errors
    ///
    /// As [`Self::query_each`].
    pub fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        let mut first = None;
        self.query_each(sql, params, |row| {
            if first.is_none() {
                first = Some(row);
            }
            Ok(())
        })?;
        Ok(first)
    }

    /// First column of the first row as an integer.
    ///
    /// # Errors
    ///
    /// [`MigrationError::NoRows`] if the query returns nothing, or a decode
    /// error if the value is not an integer.
    pub fn query_i64(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.query_opt(sql, params)?
            .ok_or_else(|| MigrationError::NoRows {
                statement: self.prepare(sql),
            })?
            .get_i64(0)
    }

    /// Run `body` inside a transaction, rolling back if it fails.
    ///
    /// # Errors
    ///
    /// The body's error, or a begin/commit failure.
    pub fn transaction<T>(&self, body: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.cancel.check()?;
        self.backend.begin()?;
        match body(self) {
            Ok(value) => {
                self.backend.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.backend.rollback() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Rewrite `?` placeholders as `$1, $2, ...`, leaving quoted text alone.
#[must_use]
pub fn rebind_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut n = 0;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (Some(q), _) if c == q => {
                quote = None;
                out.push(c);
            }
            (None, '?') => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_numbers_placeholders_in_order() {
        assert_eq!(
            rebind_placeholders("UPDATE t SET a = ? WHERE b = ? AND c = ?"),
            "UPDATE t SET a = $1 WHERE b = $2 AND c = $3"
        );
    }

    #[test]
    fn rebind_skips_quoted_question_marks() {
        assert_eq!(
            rebind_placeholders("SELECT '?', \"?\" FROM t WHERE x = ? AND y = 'it''s?'"),
            "SELECT '?', \"?\" FROM t WHERE x = $1 AND y = 'it''s?'"
        );
    }

    #[test]
    fn session_substitutes_prefix_per_dialect() {
        let backend = fake::FakeBackend::new();
        let pg = Session::new(&backend, Dialect::Postgres).with_prefix("gc_");
        assert_eq!(
            pg.prepare("SELECT id FROM DBPREFIXboards WHERE dir = ?"),
            "SELECT id FROM gc_boards WHERE dir = $1"
        );
        let my = Session::new(&backend, Dialect::Mysql).with_prefix("gc_");
        assert_eq!(
            my.prepare("SELECT id FROM DBPREFIXboards WHERE dir = ?"),
            "SELECT id FROM gc_boards WHERE dir = ?"
        );
        assert_eq!(my.table("DBPREFIXposts"), "gc_posts");
        assert_eq!(my.table("posts"), "gc_posts");
    }

    #[test]
    fn cancelled_session_issues_no_statements() {
        let backend = fake::FakeBackend::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let session = Session::new(&backend, Dialect::Mysql).with_cancel(cancel);
        let err = session.exec("DROP TABLE x", &[]).expect_err("cancelled");
        assert!(matches!(err, MigrationError::Cancelled));
        assert!(backend.executed().is_empty());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let backend = fake::FakeBackend::new();
        backend.fail_on("INSERT");
        let session = Session::new(&backend, Dialect::Mysql);
        let result = session.transaction(|s| s.exec("INSERT INTO t VALUES (1)", &[]));
        assert!(result.is_err());
        assert_eq!(backend.transaction_log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn row_decoding_accepts_driver_shapes() {
        let row = Row::new(vec![
            SqlValue::Text("42".into()),
            SqlValue::Int(1),
            SqlValue::Text("t".into()),
            SqlValue::Text("2020-04-01 12:30:00".into()),
            SqlValue::Null,
        ]);
        assert_eq!(row.get_i64(0).expect("int"), 42);
        assert!(row.get_bool(1).expect("bool"));
        assert!(row.get_bool(2).expect("bool"));
        assert_eq!(
            row.get_timestamp(3).expect("ts").format(TIMESTAMP_FORMAT).to_string(),
            "2020-04-01 12:30:00"
        );
        assert_eq!(row.get_opt_i64(4).expect("null"), None);
        assert!(row.get_string(4).is_err());
        assert!(row.value(9).is_err());
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(3_i64)), SqlValue::Int(3));
    }
}

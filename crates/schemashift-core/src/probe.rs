//! Catalog introspection: table and column presence across dialects.
//!
//! Absence is an answer, not an error. [`ColumnProbe::column_type`] returns
//! an empty string for a missing column (or missing table) and
//! [`ColumnProbe::table_exists`] returns `false`. Only a failing catalog
//! query surfaces as [`MigrationError::Probe`].

use crate::db::{SqlValue, Session};
use crate::error::{MigrationError, Result};

/// Presence and declared type of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub table: String,
    pub column: String,
    /// Dialect-specific type name, empty when the column is absent.
    pub declared_type: String,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn exists(&self) -> bool {
        !self.declared_type.is_empty()
    }

    #[must_use]
    pub fn is_string_type(&self) -> bool {
        is_string_type(&self.declared_type)
    }
}

/// True for `varchar...` and `text` declared types, in any case.
#[must_use]
pub fn is_string_type(declared: &str) -> bool {
    let lower = declared.trim().to_ascii_lowercase();
    lower.starts_with("varchar") || lower == "text"
}

/// Escape `LIKE` wildcards using `!` as the escape character.
#[must_use]
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '!' | '%' | '_') {
            out.push('!');
        }
        out.push(c);
    }
    out
}

/// Dialect-aware catalog queries over a [`Session`].
#[derive(Clone, Copy)]
pub struct ColumnProbe<'s> {
    session: &'s Session<'s>,
}

impl<'s> ColumnProbe<'s> {
    #[must_use]
    pub const fn new(session: &'s Session<'s>) -> Self {
        Self { session }
    }

    /// Declared type of `table.column`, or an empty string if either is
    /// absent. `table` may carry the `DBPREFIX` token.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog query itself fails.
    pub fn column_type(&self, table: &str, column: &str) -> Result<String> {
        let dialect = self.session.dialect();
        let table = self.session.table(table);
        let mut params: Vec<SqlValue> = Vec::with_capacity(3);
        if dialect.column_type_params() {
            params.push(self.session.schema().into());
        }
        params.push(table.as_str().into());
        params.push(column.into());

        let row = self
            .session
            .query_opt(dialect.column_type_query(), &params)
            .map_err(|e| probe_error(format!("{table}.{column}"), e))?;
        match row {
            Some(row) => Ok(row
                .get_opt_string(0)
                .map_err(|e| probe_error(format!("{table}.{column}"), e))?
                .unwrap_or_default()),
            None => Ok(String::new()),
        }
    }

    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog query itself fails.
    pub fn describe(&self, table: &str, column: &str) -> Result<ColumnDescriptor> {
        Ok(ColumnDescriptor {
            table: self.session.table(table),
            column: column.to_string(),
            declared_type: self.column_type(table, column)?,
        })
    }

    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog query itself fails.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        Ok(!self.column_type(table, column)?.is_empty())
    }

    /// Whether `table` exists. `table` may carry the `DBPREFIX` token.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog query itself fails.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let table = self.session.table(table);
        let count = self
            .session
            .query_i64(
                self.session.dialect().table_count_query(),
                &[table.as_str().into()],
            )
            .map_err(|e| probe_error(table.clone(), e))?;
        Ok(count > 0)
    }

    /// Whether any table starts with the configured prefix. An empty prefix
    /// matches nothing, since every table would qualify.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog query itself fails.
    pub fn prefixed_tables_exist(&self) -> Result<bool> {
        let prefix = self.session.prefix();
        if prefix.is_empty() {
            return Ok(false);
        }
        let pattern = format!("{}%", escape_like(prefix));
        let count = self
            .session
            .query_i64(
                self.session.dialect().table_like_query(),
                &[pattern.into()],
            )
            .map_err(|e| probe_error(format!("{prefix}*"), e))?;
        Ok(count > 0)
    }
}

impl Session<'_> {
    /// Catalog probe bound to this session.
    #[must_use]
    pub const fn probe(&self) -> ColumnProbe<'_> {
        ColumnProbe::new(self)
    }
}

fn probe_error(object: String, source: MigrationError) -> MigrationError {
    if source.is_timeout() {
        return source;
    }
    MigrationError::Probe {
        object,
        source: Box::new(source),
    }
}

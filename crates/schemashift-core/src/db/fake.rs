//! Scripted backend that imitates a MySQL/Postgres catalog for unit tests.
//!
//! It answers the catalog probes from an in-memory table/column map, applies
//! the column DDL shapes the step library emits, and records every other
//! statement so tests can assert on the generated SQL. Like MySQL, a schema
//! predicate bound to an empty name finds nothing.

use std::cell::RefCell;
use std::collections::BTreeMap;

use super::{Backend, Row, SqlValue};
use crate::error::{MigrationError, Result};

#[derive(Default)]
struct Catalog {
    tables: BTreeMap<String, Vec<(String, String)>>,
    db_collation: String,
    table_collations: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct FakeBackend {
    catalog: RefCell<Catalog>,
    canned: RefCell<Vec<(String, Vec<Row>)>>,
    executed: RefCell<Vec<String>>,
    tx_log: RefCell<Vec<&'static str>>,
    fail_on: RefCell<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.catalog.borrow_mut().db_collation = "utf8mb4_unicode_ci".to_string();
        fake
    }

    /// Add a table with `(column, type)` pairs.
    pub fn table(&self, name: &str, columns: &[(&str, &str)]) -> &Self {
        self.catalog.borrow_mut().tables.insert(
            name.to_string(),
            columns
                .iter()
                .map(|(c, t)| ((*c).to_string(), (*t).to_string()))
                .collect(),
        );
        self
    }

    pub fn set_db_collation(&self, collation: &str) {
        self.catalog.borrow_mut().db_collation = collation.to_string();
    }

    pub fn set_table_collation(&self, table: &str, collation: &str) {
        self.catalog
            .borrow_mut()
            .table_collations
            .insert(table.to_string(), collation.to_string());
    }

    /// Rows returned by any query containing `needle`.
    pub fn canned(&self, needle: &str, rows: Vec<Row>) {
        self.canned.borrow_mut().push((needle.to_string(), rows));
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.borrow_mut() = Some(needle.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.borrow().clone()
    }

    pub fn transaction_log(&self) -> Vec<&'static str> {
        self.tx_log.borrow().clone()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column_type(table, column).is_some()
    }

    pub fn column_type(&self, table: &str, column: &str) -> Option<String> {
        self.catalog
            .borrow()
            .tables
            .get(table)
            .and_then(|cols| cols.iter().find(|(c, _)| c == column))
            .map(|(_, t)| t.clone())
    }

    fn check_fail(&self, sql: &str) -> Result<()> {
        match self.fail_on.borrow().as_deref() {
            Some(needle) if sql.contains(needle) => {
                Err(MigrationError::sql(sql, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn apply_ddl(&self, sql: &str) {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let mut catalog = self.catalog.borrow_mut();
        match words.as_slice() {
            ["ALTER", "DATABASE", ..] => {
                if let Some(pos) = words.iter().position(|w| *w == "COLLATE") {
                    if let Some(c) = words.get(pos + 2) {
                        catalog.db_collation = (*c).to_string();
                    }
                }
            }
            ["ALTER", "TABLE", table, "CONVERT", ..] => {
                if let Some(c) = words.last() {
                    catalog
                        .table_collations
                        .insert((*table).to_string(), (*c).to_string());
                }
            }
            ["ALTER", "TABLE", table, "ADD", "COLUMN", column, ty, ..] => {
                if let Some(cols) = catalog.tables.get_mut(*table) {
                    cols.push(((*column).to_string(), base_type(ty)));
                }
            }
            ["ALTER", "TABLE", table, "DROP", "COLUMN", column, ..] => {
                if let Some(cols) = catalog.tables.get_mut(*table) {
                    cols.retain(|(c, _)| c != column);
                }
            }
            ["ALTER", "TABLE", table, "CHANGE", from, to, ty, ..] => {
                if let Some(cols) = catalog.tables.get_mut(*table) {
                    if let Some(col) = cols.iter_mut().find(|(c, _)| c == from) {
                        *col = ((*to).to_string(), base_type(ty));
                    }
                }
            }
            ["ALTER", "TABLE", table, "RENAME", "COLUMN", from, "TO", to] => {
                if let Some(cols) = catalog.tables.get_mut(*table) {
                    if let Some(col) = cols.iter_mut().find(|(c, _)| c == from) {
                        col.0 = (*to).to_string();
                    }
                }
            }
            ["CREATE", "TABLE", table, ..] => {
                let name = table.split('(').next().unwrap_or(*table);
                catalog.tables.entry(name.to_string()).or_default();
            }
            ["DROP", "TABLE", rest @ ..] => {
                if let Some(name) = rest.iter().rev().find(|w| **w != "EXISTS" && **w != "IF") {
                    catalog.tables.remove(*name);
                }
            }
            _ => {}
        }
    }
}

fn base_type(definition: &str) -> String {
    definition
        .split('(')
        .next()
        .unwrap_or(definition)
        .to_ascii_lowercase()
}

/// A MySQL schema predicate bound to `''` with no `DATABASE()` fallback
/// matches no catalog row.
fn unbound_schema(sql: &str, params: &[SqlValue]) -> bool {
    (sql.contains("TABLE_SCHEMA = ?") || sql.contains("SCHEMA_NAME = ?"))
        && text_param(params, 0).is_empty()
}

fn text_param(params: &[SqlValue], index: usize) -> String {
    match params.get(index) {
        Some(SqlValue::Text(s)) => s.clone(),
        _ => String::new(),
    }
}

impl Backend for FakeBackend {
    fn execute(&self, sql: &str, _params: &[SqlValue]) -> Result<u64> {
        self.check_fail(sql)?;
        self.executed.borrow_mut().push(sql.to_string());
        self.apply_ddl(sql);
        Ok(1)
    }

    fn execute_unprepared(&self, sql: &str) -> Result<()> {
        self.execute(sql, &[]).map(|_| ())
    }

    fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        on_row: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        self.check_fail(sql)?;
        let rows = {
            let catalog = self.catalog.borrow();
            if unbound_schema(sql, params) {
                Vec::new()
            } else if sql.contains("information_schema.COLUMNS")
                || sql.contains("information_schema.columns")
                || sql.contains("pragma_table_info")
            {
                let n = params.len();
                let table = text_param(params, n.saturating_sub(2));
                let column = text_param(params, n.saturating_sub(1));
                catalog
                    .tables
                    .get(&table)
                    .and_then(|cols| cols.iter().find(|(c, _)| *c == column))
                    .map(|(_, t)| vec![Row::new(vec![SqlValue::Text(t.clone())])])
                    .unwrap_or_default()
            } else if sql.contains("DEFAULT_COLLATION_NAME") {
                vec![Row::new(vec![SqlValue::Text(catalog.db_collation.clone())])]
            } else if sql.contains("TABLE_COLLATION") {
                catalog
                    .tables
                    .keys()
                    .filter(|t| {
                        catalog.table_collations.get(*t).map(String::as_str)
                            != Some("utf8mb4_unicode_ci")
                    })
                    .map(|t| Row::new(vec![SqlValue::Text(t.clone())]))
                    .collect()
            } else if sql.contains(" LIKE ") {
                let prefix = text_param(params, 0)
                    .trim_end_matches('%')
                    .replace('!', "");
                let count = catalog.tables.keys().filter(|t| t.starts_with(&prefix)).count();
                vec![Row::new(vec![SqlValue::Int(i64::try_from(count).unwrap_or(0))])]
            } else if sql.contains("information_schema.TABLES") || sql.contains("sqlite_master") {
                let name = text_param(params, 0);
                let count = i64::from(catalog.tables.contains_key(&name));
                vec![Row::new(vec![SqlValue::Int(count)])]
            } else {
                self.canned
                    .borrow()
                    .iter()
                    .find(|(needle, _)| sql.contains(needle.as_str()))
                    .map(|(_, rows)| rows.clone())
                    .unwrap_or_default()
            }
        };
        for row in rows {
            on_row(row)?;
        }
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        self.tx_log.borrow_mut().push("BEGIN");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.tx_log.borrow_mut().push("COMMIT");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.tx_log.borrow_mut().push("ROLLBACK");
        Ok(())
    }
}

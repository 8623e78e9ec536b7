//! Rebuild of a pre-versioning database into the version 1 layout.
//!
//! The legacy tables are renamed to `<table>_old`, the version 1 schema is
//! created from `preversioning/initdb_<dialect>.sql`, rows are copied by
//! `preversioning/oldDBMigration_<dialect>.sql`, post references are
//! rewritten, and finally the renamed tables and helper tables are dropped.
//!
//! The sequence is not atomic. A run interrupted after the renames leaves
//! `info_old` behind, which classifies as corrupted rather than clean. The
//! caller writes the version row only after [`PreVersioningMigrator::run`]
//! returns.

use std::time::Instant;

use tracing::{info, warn};

use crate::db::Session;
use crate::error::Result;
use crate::scripts::{ScriptLoader, preversioning_data_script, preversioning_init_script};
use crate::xref::{self, RewriteReport};

/// Tables of the pre-versioning layout, renamed before the rebuild.
pub const LEGACY_TABLES: [&str; 13] = [
    "announcements",
    "appeals",
    "banlist",
    "boards",
    "embeds",
    "info",
    "links",
    "posts",
    "reports",
    "sections",
    "sessions",
    "staff",
    "wordfilters",
];

/// Helper tables created by the data script or by this module.
pub const HELPER_TABLES: [&str; 4] = [
    "banlist_old_normalized",
    "thread_id_map",
    "post_id_map",
    "numbersequel_temp",
];

/// Largest value in the number sequence table used to split list columns.
pub const NUMBER_SEQUENCE_MAX: i64 = 999;

const NUMBER_SEQUENCE_BATCH: i64 = 100;

// ---------------------------------------------------------------------------
// RebuildReport
// ---------------------------------------------------------------------------

/// What a pre-versioning rebuild did.
#[derive(Debug, Default)]
pub struct RebuildReport {
    /// Legacy tables found and renamed, without prefix.
    pub renamed: Vec<String>,
    pub schema_statements: usize,
    pub data_statements: usize,
    pub rewrite: RewriteReport,
    /// Tables dropped at the end, without prefix.
    pub dropped: Vec<String>,
    pub elapsed: std::time::Duration,
}

// ---------------------------------------------------------------------------
// PreVersioningMigrator
// ---------------------------------------------------------------------------

pub struct PreVersioningMigrator<'a> {
    session: &'a Session<'a>,
    scripts: &'a ScriptLoader,
    drop_legacy_tables: bool,
}

impl<'a> PreVersioningMigrator<'a> {
    #[must_use]
    pub const fn new(session: &'a Session<'a>, scripts: &'a ScriptLoader) -> Self {
        Self {
            session,
            scripts,
            drop_legacy_tables: true,
        }
    }

    /// Keep the `_old` tables for inspection when `false`.
    #[must_use]
    pub const fn drop_legacy_tables(mut self, drop: bool) -> Self {
        self.drop_legacy_tables = drop;
        self
    }

    /// Run the rebuild.
    ///
    /// Per-board reference rewrite failures are recorded in the report and do
    /// not fail the run. While any are outstanding, `post_id_map` is kept so
    /// [`xref::rewrite_all`] can be retried.
    ///
    /// # Errors
    ///
    /// The first failing rename, script statement or drop. Scripts missing
    /// from every resource directory fail before anything is renamed.
    pub fn run(&self) -> Result<RebuildReport> {
        let start = Instant::now();
        let dialect = self.session.dialect();
        let schema = self.scripts.statements(&preversioning_init_script(dialect))?;
        let data = self.scripts.statements(&preversioning_data_script(dialect))?;

        let mut report = RebuildReport {
            renamed: self.rename_legacy_tables()?,
            ..RebuildReport::default()
        };

        for statement in &schema {
            self.session.exec(statement, &[])?;
        }
        report.schema_statements = schema.len();

        self.create_number_sequence()?;
        for statement in &data {
            self.session.exec(statement, &[])?;
        }
        report.data_statements = data.len();

        report.rewrite = xref::rewrite_all(self.session)?;

        if self.drop_legacy_tables {
            let keep_map = !report.rewrite.failures.is_empty();
            if keep_map {
                warn!(
                    failed = report.rewrite.failures.len(),
                    "keeping post_id_map until every board's references are rewritten"
                );
            }
            report.dropped = self.drop_tables(&report.renamed, keep_map)?;
        }

        report.elapsed = start.elapsed();
        info!(
            renamed = report.renamed.len(),
            schema_statements = report.schema_statements,
            data_statements = report.data_statements,
            posts_rewritten = report.rewrite.posts_rewritten,
            dropped = report.dropped.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "rebuilt pre-versioning database"
        );
        Ok(report)
    }

    fn rename_legacy_tables(&self) -> Result<Vec<String>> {
        let probe = self.session.probe();
        let mut renamed = Vec::new();
        for table in LEGACY_TABLES {
            if !probe.table_exists(table)? {
                continue;
            }
            let from = self.session.table(table);
            let to = self.session.table(&format!("{table}_old"));
            self.session.exec(&format!("ALTER TABLE {from} RENAME TO {to}"), &[])?;
            renamed.push(table.to_string());
        }
        Ok(renamed)
    }

    fn create_number_sequence(&self) -> Result<()> {
        self.session
            .exec("CREATE TABLE DBPREFIXnumbersequel_temp(num INT NOT NULL)", &[])?;
        let mut start = 1;
        while start <= NUMBER_SEQUENCE_MAX {
            let end = (start + NUMBER_SEQUENCE_BATCH - 1).min(NUMBER_SEQUENCE_MAX);
            let values = (start..=end)
                .map(|n| format!("({n})"))
                .collect::<Vec<_>>()
                .join(",");
            self.session
                .exec(&format!("INSERT INTO DBPREFIXnumbersequel_temp(num) VALUES {values}"), &[])?;
            start = end + 1;
        }
        Ok(())
    }

    fn drop_tables(&self, renamed: &[String], keep_map: bool) -> Result<Vec<String>> {
        let helpers = HELPER_TABLES
            .iter()
            .filter(|t| !(keep_map && **t == "post_id_map"))
            .map(ToString::to_string);
        let mut dropped = Vec::new();
        for table in renamed.iter().map(|t| format!("{t}_old")).chain(helpers) {
            let name = self.session.table(&table);
            self.session.exec(&format!("DROP TABLE IF EXISTS {name}"), &[])?;
            dropped.push(table);
        }
        Ok(dropped)
    }
}

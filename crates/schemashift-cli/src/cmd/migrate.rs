//! `schemashift migrate`: bring the database to the target version.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use schemashift_core::config::Config;
use schemashift_core::orchestrator::Transition;
use schemashift_core::rebuild::RebuildReport;
use schemashift_core::{
    CancelToken, Dialect, MigrationOrchestrator, MigrationOutcome, MigrationRegistry, SchemaState,
    SqlBoardResolver,
};
use serde::Serialize;
use tracing::info;

use super::{ConnectionArgs, open_sqlite, session_for, sqlite_path};
use crate::lock::{LOCK_WAIT, MigrationLock};
use crate::output::{CliError, OutputMode, render};

/// Arguments for `schemashift migrate`.
#[derive(Args, Debug, Default)]
pub struct MigrateArgs {
    /// Version to migrate to (default: the latest known version).
    #[arg(long, value_name = "VERSION")]
    pub target: Option<u32>,

    /// Keep the renamed pre-versioning tables and legacy rule tables.
    #[arg(long)]
    pub keep_legacy_tables: bool,

    /// Abort at the next statement once this many seconds have passed.
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Primary directory holding the SQL scripts.
    #[arg(long, value_name = "DIR")]
    pub sql_dir: Option<PathBuf>,
}

impl MigrateArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(target) = self.target {
            config.migration.target_version = target;
        }
        if self.keep_legacy_tables {
            config.migration.drop_legacy_tables = false;
        }
        if let Some(secs) = self.timeout {
            config.migration.timeout_secs = Some(secs);
        }
        if let Some(dir) = &self.sql_dir {
            config.migration.sql_dir.clone_from(dir);
        }
    }
}

#[derive(Debug, Serialize)]
struct RebuildSummary {
    renamed: Vec<String>,
    posts_rewritten: usize,
    rewrite_failures: Vec<String>,
    dropped: Vec<String>,
}

impl From<&RebuildReport> for RebuildSummary {
    fn from(report: &RebuildReport) -> Self {
        Self {
            renamed: report.renamed.clone(),
            posts_rewritten: report.rewrite.posts_rewritten,
            rewrite_failures: report.rewrite.failures.iter().map(ToString::to_string).collect(),
            dropped: report.dropped.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MigrateOutput {
    database: String,
    dialect: Dialect,
    initial: SchemaState,
    version: u32,
    up_to_date: bool,
    provisioned: bool,
    transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rebuild: Option<RebuildSummary>,
    elapsed_ms: u64,
}

impl MigrateOutput {
    fn new(database: &Path, dialect: Dialect, outcome: &MigrationOutcome) -> Self {
        Self {
            database: database.display().to_string(),
            dialect,
            initial: outcome.initial,
            version: outcome.version,
            up_to_date: outcome.was_up_to_date(),
            provisioned: outcome.provisioned,
            transitions: outcome.transitions.clone(),
            rebuild: outcome.rebuild.as_ref().map(RebuildSummary::from),
            elapsed_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Execute `schemashift migrate`.
pub fn run_migrate(
    args: &MigrateArgs,
    conn: &ConnectionArgs,
    output: OutputMode,
    working_dir: &Path,
) -> anyhow::Result<()> {
    let mut config = conn.load(working_dir)?;
    args.apply(&mut config);
    let database = sqlite_path(&config, working_dir)?;

    let lock = MigrationLock::acquire(&database, LOCK_WAIT).map_err(CliError::from)?;
    info!(lock = %lock.path().display(), "holding migration lock");

    let backend = open_sqlite(&database)?;
    let cancel = config
        .migration
        .timeout()
        .map_or_else(CancelToken::new, CancelToken::with_timeout);
    let session = session_for(&backend, &config).with_cancel(cancel);
    let scripts = config.migration.script_loader();
    let registry = MigrationRegistry::standard();
    let boards = SqlBoardResolver;

    let outcome = MigrationOrchestrator::new(&session, &scripts, &registry, &boards)
        .with_options(config.migration.options())
        .on_transition(move |t| {
            if !output.is_json() {
                println!("Migrating database from version {} to version {}", t.from, t.to);
            }
        })
        .run()?;
    drop(lock);

    let payload = MigrateOutput::new(&database, config.database.dialect, &outcome);
    render(output, &payload, |p, w| {
        if let Some(rebuild) = &p.rebuild {
            writeln!(
                w,
                "Rebuilt pre-versioning database: {} tables renamed, {} posts rewritten",
                rebuild.renamed.len(),
                rebuild.posts_rewritten
            )?;
            for failure in &rebuild.rewrite_failures {
                writeln!(w, "warning: {failure}")?;
            }
        }
        if p.up_to_date {
            writeln!(w, "Database is up to date (version {})", p.version)
        } else if p.provisioned {
            writeln!(w, "Provisioned clean database at version {}", p.version)
        } else {
            writeln!(
                w,
                "Migrated {} to version {} in {} ms",
                p.database, p.version, p.elapsed_ms
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut config = Config::default();
        let args = MigrateArgs {
            target: Some(3),
            keep_legacy_tables: true,
            timeout: Some(10),
            sql_dir: Some(PathBuf::from("/opt/sql")),
        };
        args.apply(&mut config);
        assert_eq!(config.migration.target_version, 3);
        assert!(!config.migration.drop_legacy_tables);
        assert_eq!(config.migration.timeout_secs, Some(10));
        assert_eq!(config.migration.sql_dir, PathBuf::from("/opt/sql"));
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let mut config = Config::default();
        MigrateArgs::default().apply(&mut config);
        assert_eq!(config, Config::default());
    }
}

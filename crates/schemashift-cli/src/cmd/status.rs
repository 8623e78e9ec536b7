//! `schemashift status`: classify the database without changing it.

use std::io::Write;
use std::path::Path;

use clap::Args;
use schemashift_core::{Dialect, ErrorCode, LATEST_VERSION, SchemaState, SchemaVersionOracle};
use serde::Serialize;

use super::{ConnectionArgs, open_sqlite, session_for, sqlite_path};
use crate::output::{CliError, OutputMode, render};

/// Arguments for `schemashift status`.
#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Classify against this version instead of the latest known one.
    #[arg(long, value_name = "VERSION")]
    pub target: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    database: String,
    dialect: Dialect,
    prefix: String,
    component: String,
    target: u32,
    schema: SchemaState,
    summary: String,
    needs_migration: bool,
}

/// Execute `schemashift status`.
pub fn run_status(
    args: &StatusArgs,
    conn: &ConnectionArgs,
    output: OutputMode,
    working_dir: &Path,
) -> anyhow::Result<()> {
    let config = conn.load(working_dir)?;
    let database = sqlite_path(&config, working_dir)?;
    if !database.is_file() {
        return Err(CliError::new(
            ErrorCode::ConfigInvalid,
            format!("database file {} does not exist", database.display()),
        )
        .into());
    }

    let backend = open_sqlite(&database)?;
    let session = session_for(&backend, &config);
    let target = args.target.unwrap_or(config.migration.target_version);
    let component = config.migration.component.clone();
    let state = SchemaVersionOracle::new(&session, target)
        .with_component(component.clone())
        .classify()?;

    let payload = StatusOutput {
        database: database.display().to_string(),
        dialect: config.database.dialect,
        prefix: config.database.prefix.clone(),
        component,
        target,
        schema: state,
        summary: state.to_string(),
        needs_migration: state.needs_migration(),
    };

    render(output, &payload, |p, w| {
        writeln!(w, "{}: {}", p.database, p.summary)?;
        if p.needs_migration {
            writeln!(w, "run `schemashift migrate` to reach version {}", p.target)?;
        } else if matches!(p.schema, SchemaState::Ahead(_)) && p.target == LATEST_VERSION {
            writeln!(w, "this binary only knows versions up to {LATEST_VERSION}")?;
        }
        Ok(())
    })
}

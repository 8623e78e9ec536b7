//! Per-dialect structural migration steps (version 1 → 2).
//!
//! A step is never recorded as "done". Every run re-probes the catalog and
//! applies only the steps whose precondition still holds, so a sequence that
//! died half way resumes where it stopped. Steps are not wrapped in one
//! transaction: MySQL commits DDL implicitly.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, info};

use crate::db::Session;
use crate::dialect::Dialect;
use crate::error::{MigrationError, Result, panic_message};
use crate::iprange::parse_ip_range;

/// Precondition probe for a custom step.
pub type PendingFn = fn(&Session<'_>) -> Result<bool>;

/// Body of a custom step.
pub type ApplyFn = fn(&Session<'_>) -> Result<()>;

/// What a step changes and how its precondition is probed.
#[derive(Debug, Clone, Copy)]
pub enum StepAction {
    /// Add `column` with `definition` when the table exists without it.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    /// Rename `from` to `to` when only the old name exists. With
    /// `add_if_neither`, a table that has neither gets `to` added.
    RenameColumn {
        table: &'static str,
        from: &'static str,
        to: &'static str,
        definition: &'static str,
        add_if_neither: bool,
    },
    /// Convert a textual column to a native type through a temporary column.
    ///
    /// Pending while `column` still has a string type or `temp` exists. The
    /// temporary column is the resume signal after an interrupted run.
    RetypeColumn {
        table: &'static str,
        column: &'static str,
        temp: &'static str,
        /// Definition of the textual column under its temporary name.
        temp_definition: &'static str,
        /// Nullable definition of the new column, added before the backfill.
        definition: &'static str,
        /// `UPDATE` converting every row from `temp` into `column`.
        convert: &'static str,
        /// Statements tightening the new column after the backfill.
        finalize: &'static [&'static str],
    },
    /// Anything the shapes above cannot express.
    Custom { pending: PendingFn, apply: ApplyFn },
}

/// One named, idempotent structural change.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub name: &'static str,
    pub action: StepAction,
}

impl MigrationStep {
    #[must_use]
    pub const fn add_column(
        name: &'static str,
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    ) -> Self {
        Self {
            name,
            action: StepAction::AddColumn {
                table,
                column,
                definition,
            },
        }
    }

    #[must_use]
    pub const fn custom(name: &'static str, pending: PendingFn, apply: ApplyFn) -> Self {
        Self {
            name,
            action: StepAction::Custom { pending, apply },
        }
    }

    /// Whether the step still has work to do.
    ///
    /// # Errors
    ///
    /// Catalog probe failures.
    pub fn is_pending(&self, session: &Session<'_>) -> Result<bool> {
        let probe = session.probe();
        match self.action {
            StepAction::AddColumn { table, column, .. } => {
                Ok(probe.table_exists(table)? && !probe.column_exists(table, column)?)
            }
            StepAction::RenameColumn {
                table,
                from,
                to,
                add_if_neither,
                ..
            } => {
                if !probe.table_exists(table)? || probe.column_exists(table, to)? {
                    return Ok(false);
                }
                Ok(add_if_neither || probe.column_exists(table, from)?)
            }
            StepAction::RetypeColumn {
                table, column, temp, ..
            } => {
                if !probe.table_exists(table)? {
                    return Ok(false);
                }
                Ok(probe.describe(table, column)?.is_string_type()
                    || probe.column_exists(table, temp)?)
            }
            StepAction::Custom { pending, .. } => pending(session),
        }
    }

    /// Apply the change. Callers check [`Self::is_pending`] first.
    ///
    /// # Errors
    ///
    /// The first failing statement.
    pub fn apply(&self, session: &Session<'_>) -> Result<()> {
        let dialect = session.dialect();
        match self.action {
            StepAction::AddColumn {
                table,
                column,
                definition,
            } => {
                session.exec(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), &[])?;
            }
            StepAction::RenameColumn {
                table,
                from,
                to,
                definition,
                ..
            } => {
                let sql = if session.probe().column_exists(table, from)? {
                    dialect.rename_column_sql(table, from, to, definition)
                } else {
                    format!("ALTER TABLE {table} ADD COLUMN {to} {definition}")
                };
                session.exec(&sql, &[])?;
            }
            StepAction::RetypeColumn {
                table,
                column,
                temp,
                temp_definition,
                definition,
                convert,
                finalize,
            } => {
                let probe = session.probe();
                if !probe.column_exists(table, temp)? {
                    session.exec(&dialect.rename_column_sql(table, column, temp, temp_definition), &[])?;
                }
                if !probe.column_exists(table, column)? {
                    session.exec(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), &[])?;
                }
                session.exec(convert, &[])?;
                for statement in finalize {
                    session.exec(statement, &[])?;
                }
                session.exec(&format!("ALTER TABLE {table} DROP COLUMN {temp}"), &[])?;
            }
            StepAction::Custom { apply, .. } => apply(session)?,
        }
        Ok(())
    }
}

/// Ordered step list for one dialect.
pub trait DialectSteps {
    fn dialect(&self) -> Dialect;
    fn steps(&self) -> Vec<MigrationStep>;
}

/// The built-in step list for `dialect`.
#[must_use]
pub fn steps_for(dialect: Dialect) -> Box<dyn DialectSteps> {
    match dialect {
        Dialect::Mysql => Box::new(mysql::MysqlSteps),
        Dialect::Postgres => Box::new(postgres::PostgresSteps),
        Dialect::Sqlite => Box::new(sqlite::SqliteSteps),
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Outcome of one pass over a step list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub applied: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

/// Run `steps` in order, applying the pending ones.
///
/// The first failure aborts the sequence. Steps applied before it stay
/// applied. A panic inside a step is caught here and reported as that
/// step's failure.
///
/// # Errors
///
/// [`MigrationError::StepFailure`] naming the failed step,
/// [`MigrationError::Probe`] if a catalog query fails, or a timeout.
pub fn run_steps(session: &Session<'_>, steps: &[MigrationStep]) -> Result<StepReport> {
    let mut report = StepReport::default();
    for step in steps {
        let pending = guarded(|| step.is_pending(session)).map_err(|e| e.in_step(step.name))?;
        if !pending {
            debug!(step = step.name, "step already applied, skipping");
            report.skipped.push(step.name);
            continue;
        }
        info!(step = step.name, dialect = %session.dialect(), "applying migration step");
        guarded(|| step.apply(session)).map_err(|e| e.in_step(step.name))?;
        report.applied.push(step.name);
    }
    Ok(report)
}

/// Run `body`, converting a panic into [`MigrationError::Panicked`].
pub(crate) fn guarded<T>(body: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(body))
        .unwrap_or_else(|payload| Err(MigrationError::Panicked(panic_message(payload.as_ref()))))
}

// ---------------------------------------------------------------------------
// Shared step bodies
// ---------------------------------------------------------------------------

pub(crate) fn ip_ban_has_ip(session: &Session<'_>) -> Result<bool> {
    let probe = session.probe();
    Ok(probe.table_exists("DBPREFIXip_ban")? && probe.column_exists("DBPREFIXip_ban", "ip")?)
}

/// Replace `ip_ban.ip` with an inclusive `range_start`/`range_end` pair.
///
/// `definition` is the nullable type of the new columns and `convert` wraps
/// the bound address text in the dialect's conversion (`?` when stored as
/// text). The `ip` column is dropped once every row is converted, so an
/// interrupted run converts again from the original values.
pub(crate) fn split_ban_ranges(
    session: &Session<'_>,
    definition: &str,
    convert: &str,
    finalize: &[&str],
) -> Result<()> {
    let probe = session.probe();
    for column in ["range_start", "range_end"] {
        if !probe.column_exists("DBPREFIXip_ban", column)? {
            session.exec(
                &format!("ALTER TABLE DBPREFIXip_ban ADD COLUMN {column} {definition}"),
                &[],
            )?;
        }
    }

    let bans = session.query_all("SELECT id, ip FROM DBPREFIXip_ban", &[])?;
    let update = format!(
        "UPDATE DBPREFIXip_ban SET range_start = {convert}, range_end = {convert} WHERE id = ?"
    );
    for row in &bans {
        let id = row.get_i64(0)?;
        let range = parse_ip_range(&row.get_string(1)?)?;
        session.exec(
            &update,
            &[
                range.start.to_string().into(),
                range.end.to_string().into(),
                id.into(),
            ],
        )?;
    }
    debug!(bans = bans.len(), "converted ban addresses to ranges");

    for statement in finalize {
        session.exec(statement, &[])?;
    }
    session.exec("ALTER TABLE DBPREFIXip_ban DROP COLUMN ip", &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteBackend;
    use crate::db::fake::FakeBackend;

    fn explode(_: &Session<'_>) -> Result<()> {
        panic!("boom")
    }

    fn always(_: &Session<'_>) -> Result<bool> {
        Ok(true)
    }

    fn fail(session: &Session<'_>) -> Result<()> {
        session.exec("INSERT INTO nowhere VALUES (1)", &[]).map(|_| ())
    }

    fn noop(_: &Session<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn add_column_skips_missing_table_and_existing_column() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        let step = MigrationStep::add_column(
            "add posts.flag",
            "DBPREFIXposts",
            "flag",
            "VARCHAR(45) NOT NULL DEFAULT ''",
        );
        assert!(!step.is_pending(&session).expect("probe"), "no table yet");

        session.exec("CREATE TABLE posts(id INT)", &[]).expect("create");
        assert!(step.is_pending(&session).expect("probe"));
        step.apply(&session).expect("apply");
        assert!(!step.is_pending(&session).expect("probe"));
    }

    #[test]
    fn rename_acts_only_when_old_name_is_alone() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        session
            .exec("CREATE TABLE threads(id INT, cyclical BOOL NOT NULL DEFAULT FALSE)", &[])
            .expect("create");
        let step = MigrationStep {
            name: "rename threads.cyclical",
            action: StepAction::RenameColumn {
                table: "DBPREFIXthreads",
                from: "cyclical",
                to: "cyclic",
                definition: "BOOL NOT NULL DEFAULT FALSE",
                add_if_neither: false,
            },
        };
        let report = run_steps(&session, &[step]).expect("first run");
        assert_eq!(report.applied, vec!["rename threads.cyclical"]);
        let probe = session.probe();
        assert!(probe.column_exists("threads", "cyclic").expect("probe"));
        assert!(!probe.column_exists("threads", "cyclical").expect("probe"));

        let report = run_steps(&session, &[step]).expect("second run");
        assert!(report.applied.is_empty());
    }

    #[test]
    fn retype_resumes_from_temporary_column() {
        let backend = FakeBackend::new();
        // Interrupted after the rename: only the temporary column is left.
        backend.table("posts", &[("id", "int"), ("ip_str", "varchar")]);
        let session = Session::new(&backend, Dialect::Mysql);
        let step = MigrationStep {
            name: "retype posts.ip",
            action: StepAction::RetypeColumn {
                table: "DBPREFIXposts",
                column: "ip",
                temp: "ip_str",
                temp_definition: "VARCHAR(45)",
                definition: "VARBINARY(16)",
                convert: "UPDATE DBPREFIXposts SET ip = INET6_ATON(ip_str)",
                finalize: &["ALTER TABLE DBPREFIXposts CHANGE ip ip VARBINARY(16) NOT NULL"],
            },
        };
        assert!(step.is_pending(&session).expect("probe"));
        run_steps(&session, &[step]).expect("resume");

        let executed = backend.executed();
        assert!(!executed.iter().any(|s| s.contains("CHANGE ip ip_str")));
        assert!(executed.contains(&"ALTER TABLE posts ADD COLUMN ip VARBINARY(16)".to_string()));
        assert_eq!(executed.last().map(String::as_str), Some("ALTER TABLE posts DROP COLUMN ip_str"));
        assert_eq!(backend.column_type("posts", "ip").as_deref(), Some("varbinary"));
        assert!(!step.is_pending(&session).expect("probe"));
    }

    #[test]
    fn first_failure_stops_the_sequence() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        let steps = [
            MigrationStep::custom("ok", always, noop),
            MigrationStep::custom("broken", always, fail),
            MigrationStep::custom("never", always, explode),
        ];
        match run_steps(&session, &steps) {
            Err(MigrationError::StepFailure { step, source }) => {
                assert_eq!(step, "broken");
                assert!(matches!(*source, MigrationError::Sql { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panicking_step_becomes_step_failure() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        let steps = [MigrationStep::custom("explodes", always, explode)];
        match run_steps(&session, &steps) {
            Err(MigrationError::StepFailure { step, source }) => {
                assert_eq!(step, "explodes");
                assert!(matches!(*source, MigrationError::Panicked(ref m) if m == "boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ban_ranges_split_on_sqlite() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        session
            .exec("CREATE TABLE ip_ban(id INTEGER PRIMARY KEY, ip VARCHAR(45) NOT NULL)", &[])
            .expect("create");
        session
            .exec("INSERT INTO ip_ban(ip) VALUES ('10.0.0.0/8'), ('192.168.1.7')", &[])
            .expect("insert");

        assert!(ip_ban_has_ip(&session).expect("probe"));
        split_ban_ranges(&session, "VARCHAR(45) NOT NULL DEFAULT ''", "?", &[]).expect("split");
        assert!(!ip_ban_has_ip(&session).expect("probe"));

        let rows = session
            .query_all("SELECT range_start, range_end FROM ip_ban ORDER BY id", &[])
            .expect("select");
        let ranges: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.get_string(0).expect("start"), r.get_string(1).expect("end")))
            .collect();
        assert_eq!(
            ranges,
            vec![
                ("10.0.0.0".to_string(), "10.255.255.255".to_string()),
                ("192.168.1.7".to_string(), "192.168.1.7".to_string()),
            ]
        );
    }

    #[test]
    fn bad_ban_address_keeps_ip_column() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        let session = Session::new(&backend, Dialect::Sqlite);
        session
            .exec("CREATE TABLE ip_ban(id INTEGER PRIMARY KEY, ip VARCHAR(45) NOT NULL)", &[])
            .expect("create");
        session
            .exec("INSERT INTO ip_ban(ip) VALUES ('not-an-ip')", &[])
            .expect("insert");
        let err = split_ban_ranges(&session, "VARCHAR(45) NOT NULL DEFAULT ''", "?", &[])
            .expect_err("invalid");
        assert!(matches!(err, MigrationError::InvalidIpRange(_)));
        assert!(ip_ban_has_ip(&session).expect("probe"));
    }
}

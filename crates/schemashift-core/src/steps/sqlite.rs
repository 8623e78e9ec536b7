//! SQLite steps. Addresses stay textual.

use super::{DialectSteps, MigrationStep, StepAction, ip_ban_has_ip, split_ban_ranges};
use crate::db::Session;
use crate::dialect::Dialect;
use crate::error::Result;

pub struct SqliteSteps;

impl DialectSteps for SqliteSteps {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn steps(&self) -> Vec<MigrationStep> {
        vec![
            MigrationStep::custom("enable foreign keys", foreign_keys_off, enable_foreign_keys),
            MigrationStep {
                name: "rename threads.cyclical",
                action: StepAction::RenameColumn {
                    table: "DBPREFIXthreads",
                    from: "cyclical",
                    to: "cyclic",
                    definition: "BOOL NOT NULL DEFAULT FALSE",
                    add_if_neither: true,
                },
            },
            MigrationStep::add_column(
                "add posts.is_secure_tripcode",
                "DBPREFIXposts",
                "is_secure_tripcode",
                "BOOL NOT NULL DEFAULT FALSE",
            ),
            MigrationStep::add_column("add posts.flag", "DBPREFIXposts", "flag", "VARCHAR(45) NOT NULL DEFAULT ''"),
            MigrationStep::add_column(
                "add posts.country",
                "DBPREFIXposts",
                "country",
                "VARCHAR(80) NOT NULL DEFAULT ''",
            ),
            // ADD COLUMN rejects CURRENT_TIMESTAMP defaults on non-empty tables.
            MigrationStep::add_column(
                "add sessions.expires",
                "DBPREFIXsessions",
                "expires",
                "TIMESTAMP NOT NULL DEFAULT '1970-01-01 00:00:00'",
            ),
            MigrationStep::add_column("add sessions.data", "DBPREFIXsessions", "data", "VARCHAR(45) NOT NULL DEFAULT ''"),
            MigrationStep::custom("ip_ban address ranges", ip_ban_has_ip, split_ip_ban),
            MigrationStep::add_column(
                "add threads.is_spoilered",
                "DBPREFIXthreads",
                "is_spoilered",
                "BOOL NOT NULL DEFAULT FALSE",
            ),
            MigrationStep::custom("add file_ban.fingerprinter", fingerprinter_missing, add_fingerprinter),
            MigrationStep::custom("add file_ban.ban_ip", ban_ip_missing, add_ban_ip),
            MigrationStep::custom("add file_ban.ban_ip_message", ban_ip_message_missing, add_ban_ip_message),
        ]
    }
}

/// `foreign_keys` is a connection setting that SQLite does not store in the
/// file, so every new connection reports this step as pending again. It
/// changes no schema.
fn foreign_keys_off(session: &Session<'_>) -> Result<bool> {
    Ok(session.query_i64("PRAGMA foreign_keys", &[])? == 0)
}

fn enable_foreign_keys(session: &Session<'_>) -> Result<()> {
    session.exec_unprepared("PRAGMA foreign_keys = ON")
}

fn split_ip_ban(session: &Session<'_>) -> Result<()> {
    split_ban_ranges(session, "VARCHAR(45) NOT NULL DEFAULT ''", "?", &[])
}

/// The file_ban columns only matter until the legacy rules have been folded
/// into the filter tables.
fn file_ban_missing(session: &Session<'_>, column: &str) -> Result<bool> {
    let probe = session.probe();
    Ok(!probe.table_exists("DBPREFIXfilters")?
        && probe.table_exists("DBPREFIXfile_ban")?
        && !probe.column_exists("DBPREFIXfile_ban", column)?)
}

fn fingerprinter_missing(session: &Session<'_>) -> Result<bool> {
    file_ban_missing(session, "fingerprinter")
}

fn add_fingerprinter(session: &Session<'_>) -> Result<()> {
    session
        .exec("ALTER TABLE DBPREFIXfile_ban ADD COLUMN fingerprinter VARCHAR(64) DEFAULT ''", &[])
        .map(|_| ())
}

fn ban_ip_missing(session: &Session<'_>) -> Result<bool> {
    file_ban_missing(session, "ban_ip")
}

fn add_ban_ip(session: &Session<'_>) -> Result<()> {
    session
        .exec("ALTER TABLE DBPREFIXfile_ban ADD COLUMN ban_ip BOOL NOT NULL DEFAULT FALSE", &[])
        .map(|_| ())
}

fn ban_ip_message_missing(session: &Session<'_>) -> Result<bool> {
    file_ban_missing(session, "ban_ip_message")
}

fn add_ban_ip_message(session: &Session<'_>) -> Result<()> {
    session
        .exec("ALTER TABLE DBPREFIXfile_ban ADD COLUMN ban_ip_message TEXT", &[])
        .map(|_| ())
}

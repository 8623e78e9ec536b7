//! MySQL/MariaDB steps.

use super::{DialectSteps, MigrationStep, StepAction, ip_ban_has_ip, split_ban_ranges};
use crate::db::Session;
use crate::dialect::Dialect;
use crate::error::Result;

const CHARSET: &str = "utf8mb4";
const COLLATION: &str = "utf8mb4_unicode_ci";

pub struct MysqlSteps;

impl DialectSteps for MysqlSteps {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn steps(&self) -> Vec<MigrationStep> {
        vec![
            MigrationStep::custom("database collation", database_collation_pending, set_database_collation),
            MigrationStep::custom("table collations", table_collations_pending, convert_table_collations),
            MigrationStep::custom("ip_ban address ranges", ip_ban_has_ip, split_ip_ban),
            MigrationStep {
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
            },
            MigrationStep {
                name: "retype reports.ip",
                action: StepAction::RetypeColumn {
                    table: "DBPREFIXreports",
                    column: "ip",
                    temp: "ip_str",
                    temp_definition: "VARCHAR(45)",
                    definition: "VARBINARY(16)",
                    convert: "UPDATE DBPREFIXreports SET ip = INET6_ATON(ip_str)",
                    finalize: &["ALTER TABLE DBPREFIXreports CHANGE ip ip VARBINARY(16) NOT NULL"],
                },
            },
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
                "add threads.is_spoilered",
                "DBPREFIXthreads",
                "is_spoilered",
                "BOOL NOT NULL DEFAULT FALSE",
            ),
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
        ]
    }
}

fn database_collation_pending(session: &Session<'_>) -> Result<bool> {
    let current = session
        .query_opt(
            "SELECT DEFAULT_COLLATION_NAME FROM information_schema.SCHEMATA \
             WHERE SCHEMA_NAME = COALESCE(NULLIF(?, ''), DATABASE())",
            &[session.schema().into()],
        )?
        .map(|row| row.get_opt_string(0))
        .transpose()?
        .flatten();
    Ok(current.as_deref() != Some(COLLATION))
}

fn set_database_collation(session: &Session<'_>) -> Result<()> {
    let target = match session.schema() {
        "" => String::new(),
        schema => format!(" `{schema}`"),
    };
    // ALTER DATABASE is not allowed through the prepared statement protocol.
    session.exec_unprepared(&format!(
        "ALTER DATABASE{target} CHARACTER SET = {CHARSET} COLLATE = {COLLATION}"
    ))
}

const UNCONVERTED_TABLES: &str = "SELECT TABLE_NAME FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE()) AND TABLE_TYPE = 'BASE TABLE' AND TABLE_COLLATION <> 'utf8mb4_unicode_ci'";

fn unconverted_tables(session: &Session<'_>) -> Result<Vec<String>> {
    session
        .query_all(UNCONVERTED_TABLES, &[session.schema().into()])?
        .iter()
        .map(|row| row.get_string(0))
        .collect()
}

fn table_collations_pending(session: &Session<'_>) -> Result<bool> {
    Ok(!unconverted_tables(session)?.is_empty())
}

fn convert_table_collations(session: &Session<'_>) -> Result<()> {
    for table in unconverted_tables(session)? {
        session.exec(
            &format!("ALTER TABLE {table} CONVERT TO CHARACTER SET {CHARSET} COLLATE {COLLATION}"),
            &[],
        )?;
    }
    Ok(())
}

fn split_ip_ban(session: &Session<'_>) -> Result<()> {
    split_ban_ranges(
        session,
        "VARBINARY(16)",
        "INET6_ATON(?)",
        &[
            "ALTER TABLE DBPREFIXip_ban MODIFY range_start VARBINARY(16) NOT NULL",
            "ALTER TABLE DBPREFIXip_ban MODIFY range_end VARBINARY(16) NOT NULL",
        ],
    )
}

//! Postgres steps. Addresses become native `INET`.

use super::{DialectSteps, MigrationStep, StepAction, ip_ban_has_ip, split_ban_ranges};
use crate::db::Session;
use crate::dialect::Dialect;
use crate::error::Result;

pub struct PostgresSteps;

impl DialectSteps for PostgresSteps {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn steps(&self) -> Vec<MigrationStep> {
        vec![
            MigrationStep {
                name: "retype posts.ip",
                action: StepAction::RetypeColumn {
                    table: "DBPREFIXposts",
                    column: "ip",
                    temp: "ip_str",
                    temp_definition: "VARCHAR(45)",
                    definition: "INET",
                    convert: "UPDATE DBPREFIXposts SET ip = ip_str::INET",
                    finalize: &["ALTER TABLE DBPREFIXposts ALTER COLUMN ip SET NOT NULL"],
                },
            },
            MigrationStep {
                name: "retype reports.ip",
                action: StepAction::RetypeColumn {
                    table: "DBPREFIXreports",
                    column: "ip",
                    temp: "ip_str",
                    temp_definition: "VARCHAR(45)",
                    definition: "INET",
                    convert: "UPDATE DBPREFIXreports SET ip = ip_str::INET",
                    finalize: &["ALTER TABLE DBPREFIXreports ALTER COLUMN ip SET NOT NULL"],
                },
            },
            MigrationStep::custom("ip_ban address ranges", ip_ban_has_ip, split_ip_ban),
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

fn split_ip_ban(session: &Session<'_>) -> Result<()> {
    split_ban_ranges(
        session,
        "INET",
        "CAST(? AS INET)",
        &[
            "ALTER TABLE DBPREFIXip_ban ALTER COLUMN range_start SET NOT NULL",
            "ALTER TABLE DBPREFIXip_ban ALTER COLUMN range_end SET NOT NULL",
        ],
    )
}

//! End-to-end tests for the `schemashift` binary against SQLite files.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use tempfile::TempDir;

const SQL_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../schemashift-core/sql");

struct Board {
    dir: TempDir,
}

impl Board {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("gochan.db")
    }

    /// A command already pointed at this board's database and the SQL scripts.
    fn cmd(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("schemashift"));
        cmd.current_dir(self.dir.path())
            .env_remove("SCHEMASHIFT_LOG")
            .arg("--database")
            .arg(self.db())
            .args(["--prefix", "gc_", subcommand]);
        if subcommand == "migrate" {
            cmd.arg("--sql-dir").arg(SQL_DIR);
        }
        cmd
    }

    fn version(&self) -> i64 {
        read_version(&self.db())
    }
}

fn read_version(db: &Path) -> i64 {
    Connection::open(db)
        .expect("open")
        .query_row(
            "SELECT version FROM gc_database_version WHERE component = 'main'",
            [],
            |row| row.get(0),
        )
        .expect("version row")
}

#[test]
fn clean_database_is_provisioned_at_latest() {
    let board = Board::new();
    board
        .cmd("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Provisioned clean database at version 4"));
    assert_eq!(board.version(), 4);
}

#[test]
fn second_run_reports_up_to_date() {
    let board = Board::new();
    board.cmd("migrate").assert().success();
    board
        .cmd("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database is up to date (version 4)"))
        .stdout(predicate::str::contains("Migrating database").not());
}

#[test]
fn older_database_walks_each_version() {
    let board = Board::new();
    board.cmd("migrate").args(["--target", "1"]).assert().success();
    assert_eq!(board.version(), 1);

    board
        .cmd("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Migrating database from version 1 to version 2"))
        .stdout(predicate::str::contains("Migrating database from version 2 to version 3"))
        .stdout(predicate::str::contains("Migrating database from version 3 to version 4"));
    assert_eq!(board.version(), 4);
}

#[test]
fn status_json_reports_state_without_writing() {
    let board = Board::new();
    board.cmd("migrate").args(["--target", "2"]).assert().success();

    let output = board.cmd("status").arg("--json").output().expect("run status");
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["schema"]["state"], "behind");
    assert_eq!(json["schema"]["version"], 2);
    assert_eq!(json["target"], 4);
    assert_eq!(json["needs_migration"], true);
    assert_eq!(board.version(), 2);
}

#[test]
fn ahead_database_fails_with_code_on_stderr() {
    let board = Board::new();
    Connection::open(board.db())
        .expect("open")
        .execute_batch(
            "CREATE TABLE gc_database_version(component VARCHAR(40) NOT NULL PRIMARY KEY, version INT NOT NULL);
             INSERT INTO gc_database_version VALUES ('main', 9);",
        )
        .expect("fixture");

    board
        .cmd("migrate")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("E2003"))
        .stderr(predicate::str::contains("AheadOfTarget"))
        .stderr(predicate::str::contains("hint:"));
    assert_eq!(board.version(), 9);
}

#[test]
fn json_errors_are_structured() {
    let board = Board::new();
    Connection::open(board.db())
        .expect("open")
        .execute_batch("CREATE TABLE gc_posts(id INT);")
        .expect("fixture");

    let output = board.cmd("migrate").arg("--json").output().expect("run migrate");
    assert_eq!(output.status.code(), Some(1));
    let json: serde_json::Value = serde_json::from_slice(&output.stderr).expect("json");
    assert_eq!(json["error"]["category"], "Corrupted");
    assert_eq!(json["error"]["code"], "E2004");
}

#[test]
fn missing_scripts_fail_the_provisioning_step() {
    let board = Board::new();
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("schemashift"));
    cmd.current_dir(board.dir.path())
        .arg("--database")
        .arg(board.db())
        .args(["migrate", "--sql-dir", "no-such-dir"])
        .env("SCHEMASHIFT_LOG", "off")
        .assert()
        .failure()
        .stderr(predicate::str::contains("provision clean database"))
        .stderr(predicate::str::contains("initdb_sqlite3.sql not found"));
}

#[test]
fn network_dialect_is_refused() {
    let board = Board::new();
    board
        .cmd("status")
        .args(["--dialect", "postgres"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1002"));
}

#[test]
fn config_file_supplies_connection_settings() {
    let board = Board::new();
    std::fs::write(
        board.dir.path().join("schemashift.toml"),
        format!(
            "[database]\npath = \"gochan.db\"\nprefix = \"gc_\"\n\n[migration]\nsql_dir = \"{SQL_DIR}\"\nfallback_dirs = []\n"
        ),
    )
    .expect("write config");

    Command::new(assert_cmd::cargo::cargo_bin!("schemashift"))
        .current_dir(board.dir.path())
        .arg("migrate")
        .assert()
        .success();
    assert_eq!(board.version(), 4);
}

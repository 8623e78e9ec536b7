#![forbid(unsafe_code)]

mod cmd;
mod lock;
mod output;

use clap::{Parser, Subcommand};
use cmd::ConnectionArgs;
use output::OutputMode;
use schemashift_core::Dialect;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "schemashift: schema version detection and migration for imageboard databases",
    long_about = None
)]
struct Cli {
    /// Log engine progress at info level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./schemashift.toml, then the user config dir).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    /// SQL dialect: sqlite3, mysql or postgres.
    #[arg(long, global = true)]
    dialect: Option<Dialect>,

    /// Table prefix substituted for DBPREFIX.
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    fn connection(&self) -> ConnectionArgs {
        ConnectionArgs {
            config: self.config.clone(),
            database: self.database.clone(),
            dialect: self.dialect,
            prefix: self.prefix.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Migrate the database to the target version",
        long_about = "Detect the database layout and apply every migration needed to reach the target version.",
        after_help = "EXAMPLES:\n    # Migrate to the latest version\n    schemashift --database gochan.db --prefix gc_ migrate\n\n    # Keep the legacy tables for inspection\n    schemashift migrate --keep-legacy-tables\n\n    # Emit machine-readable output\n    schemashift --json migrate"
    )]
    Migrate(cmd::migrate::MigrateArgs),

    #[command(
        about = "Show the database's schema state",
        long_about = "Classify the database against the target version without changing it.",
        after_help = "EXAMPLES:\n    # Show the state\n    schemashift --database gochan.db status\n\n    # Emit machine-readable output\n    schemashift --json status"
    )]
    Status(cmd::status::StatusArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SCHEMASHIFT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));

    let format = env::var("SCHEMASHIFT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let output = cli.output_mode();
    let conn = cli.connection();
    let working_dir = match env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("error: cannot read the working directory: {err}");
            return ExitCode::FAILURE;
        }
    };

    let command_result = match &cli.command {
        Commands::Migrate(args) => cmd::migrate::run_migrate(args, &conn, output, &working_dir),
        Commands::Status(args) => cmd::status::run_status(args, &conn, output, &working_dir),
    };

    match command_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = output::render_error(output, &output::classify(&err));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "schemashift",
            "migrate",
            "--database",
            "board.db",
            "--prefix",
            "gc_",
            "--json",
        ]);
        assert!(cli.output_mode().is_json());
        let conn = cli.connection();
        assert_eq!(conn.database, Some(PathBuf::from("board.db")));
        assert_eq!(conn.prefix.as_deref(), Some("gc_"));
    }

    #[test]
    fn dialect_aliases_parse() {
        let cli = Cli::parse_from(["schemashift", "--dialect", "sqlite", "status"]);
        assert_eq!(cli.dialect, Some(Dialect::Sqlite));
        assert!(Cli::try_parse_from(["schemashift", "--dialect", "oracle", "status"]).is_err());
    }

    #[test]
    fn migrate_flags_parse() {
        let cli = Cli::parse_from([
            "schemashift",
            "migrate",
            "--target",
            "3",
            "--keep-legacy-tables",
            "--timeout",
            "60",
        ]);
        match cli.command {
            Commands::Migrate(args) => {
                assert_eq!(args.target, Some(3));
                assert!(args.keep_legacy_tables);
                assert_eq!(args.timeout, Some(60));
                assert!(args.sql_dir.is_none());
            }
            Commands::Status(_) => panic!("expected migrate"),
        }
    }

    #[test]
    fn human_mode_is_default() {
        let cli = Cli::parse_from(["schemashift", "status"]);
        assert_eq!(cli.output_mode(), OutputMode::Human);
    }
}

//! schemashift-core: schema version detection and migration for imageboard
//! databases.
//!
//! # Conventions
//!
//! - **Errors**: engine operations return [`error::Result`] with a typed
//!   [`MigrationError`]; configuration loading uses `anyhow`.
//! - **Logging**: `tracing` macros with structured fields.
//! - **SQL**: statements name tables with the `DBPREFIX` token and `?`
//!   placeholders; the [`db::Session`] rewrites both per run.

pub mod cancel;
pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod iprange;
pub mod legacy;
pub mod oracle;
pub mod orchestrator;
pub mod probe;
pub mod rebuild;
pub mod scripts;
pub mod steps;
pub mod xref;

pub use cancel::CancelToken;
pub use db::{Backend, Session, SqliteBackend};
pub use dialect::Dialect;
pub use error::{ErrorCode, MigrationError};
pub use legacy::{BoardResolver, SqlBoardResolver};
pub use oracle::{SchemaState, SchemaVersionOracle};
pub use orchestrator::{
    LATEST_VERSION, MigrationContext, MigrationOptions, MigrationOrchestrator, MigrationOutcome,
    MigrationRegistry, VersionMigration,
};
pub use scripts::ScriptLoader;

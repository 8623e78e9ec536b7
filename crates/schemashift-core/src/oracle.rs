//! Classifies a database into exactly one [`SchemaState`].
//!
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! 1. version table present: compare its row for the component to the target
//! 2. legacy `info` table present: pre-versioning layout
//! 3. `info_old` present: an interrupted pre-versioning rebuild
//! 4. any prefixed table present: unversioned, ambiguous
//! 5. otherwise: clean
//!
//! Classification only reads the catalog and the version row.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::db::Session;
use crate::error::{MigrationError, Result};

/// Version-tracking table, one row per component.
pub const VERSION_TABLE: &str = "DBPREFIXdatabase_version";

/// Marker table of the pre-versioning layout.
pub const LEGACY_MARKER_TABLE: &str = "DBPREFIXinfo";

/// Marker table after a rebuild renamed it out of the way.
pub const RENAMED_MARKER_TABLE: &str = "DBPREFIXinfo_old";

/// Component key used when none is configured.
pub const DEFAULT_COMPONENT: &str = "main";

/// Why a database was classified as [`SchemaState::Corrupted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Corruption {
    /// `info_old` exists: a pre-versioning rebuild stopped part way.
    InterruptedRebuild,
    /// Prefixed tables exist but nothing says which version they are.
    Unversioned,
}

impl Corruption {
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::InterruptedRebuild => "a pre-versioning rebuild was interrupted (info_old exists)",
            Self::Unversioned => "tables exist but the version table is missing",
        }
    }
}

/// Layout of the database relative to a target version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum SchemaState {
    /// No tables of this application exist.
    Clean,
    /// The oldest layout, identified by its `info` table.
    PreVersioning,
    /// Tables exist that cannot be safely identified.
    Corrupted(Corruption),
    Behind(u32),
    UpToDate(u32),
    Ahead(u32),
}

impl SchemaState {
    /// Version recorded in the version table, if there is one.
    #[must_use]
    pub const fn version(self) -> Option<u32> {
        match self {
            Self::Behind(v) | Self::UpToDate(v) | Self::Ahead(v) => Some(v),
            Self::Clean | Self::PreVersioning | Self::Corrupted(_) => None,
        }
    }

    #[must_use]
    pub const fn needs_migration(self) -> bool {
        matches!(self, Self::Clean | Self::PreVersioning | Self::Behind(_))
    }
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::PreVersioning => f.write_str("pre-versioning"),
            Self::Corrupted(why) => write!(f, "corrupted ({})", why.describe()),
            Self::Behind(v) => write!(f, "behind (version {v})"),
            Self::UpToDate(v) => write!(f, "up to date (version {v})"),
            Self::Ahead(v) => write!(f, "ahead (version {v})"),
        }
    }
}

/// Read-only classifier bound to one session.
pub struct SchemaVersionOracle<'a> {
    session: &'a Session<'a>,
    component: String,
    target: u32,
}

impl<'a> SchemaVersionOracle<'a> {
    #[must_use]
    pub fn new(session: &'a Session<'a>, target: u32) -> Self {
        Self {
            session,
            component: DEFAULT_COMPONENT.to_string(),
            target,
        }
    }

    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    #[must_use]
    pub const fn target(&self) -> u32 {
        self.target
    }

    /// Classify the database.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Probe`] if the catalog cannot be read,
    /// [`MigrationError::InvalidVersion`] if the version table does not hold
    /// exactly one row for the component.
    pub fn classify(&self) -> Result<SchemaState> {
        let probe = self.session.probe();
        let state = if probe.table_exists(VERSION_TABLE)? {
            let version = self.recorded_version()?;
            match version.cmp(&self.target) {
                Ordering::Less => SchemaState::Behind(version),
                Ordering::Equal => SchemaState::UpToDate(version),
                Ordering::Greater => SchemaState::Ahead(version),
            }
        } else if probe.table_exists(LEGACY_MARKER_TABLE)? {
            SchemaState::PreVersioning
        } else if probe.table_exists(RENAMED_MARKER_TABLE)? {
            SchemaState::Corrupted(Corruption::InterruptedRebuild)
        } else if probe.prefixed_tables_exist()? {
            SchemaState::Corrupted(Corruption::Unversioned)
        } else {
            SchemaState::Clean
        };
        debug!(%state, component = %self.component, target = self.target, "classified database");
        Ok(state)
    }

    /// The single version row for the component.
    ///
    /// # Errors
    ///
    /// [`MigrationError::InvalidVersion`] for zero or several rows, or a
    /// decode error for a negative or non-integer version.
    pub fn recorded_version(&self) -> Result<u32> {
        let rows = self.session.query_all(
            "SELECT version FROM DBPREFIXdatabase_version WHERE component = ?",
            &[self.component.as_str().into()],
        )?;
        let [row] = rows.as_slice() else {
            return Err(MigrationError::InvalidVersion {
                component: self.component.clone(),
                rows: rows.len(),
            });
        };
        let version = row.get_i64(0)?;
        u32::try_from(version).map_err(|_| MigrationError::Decode {
            index: 0,
            expected: "non-negative version",
            found: version.to_string(),
        })
    }
}

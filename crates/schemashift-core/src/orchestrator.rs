//! Top-level migration entry point.
//!
//! [`MigrationOrchestrator::run`] classifies the database, provisions or
//! rebuilds it when needed, then walks the registered version transitions
//! up to the target, recording the version row after each one.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::db::Session;
use crate::error::{MigrationError, Result};
use crate::legacy::{BoardResolver, LegacyRuleTransformer};
use crate::oracle::{DEFAULT_COMPONENT, SchemaState, SchemaVersionOracle};
use crate::rebuild::{PreVersioningMigrator, RebuildReport};
use crate::scripts::{ScriptLoader, init_script};
use crate::steps::{guarded, run_steps, steps_for};

/// Latest schema version understood by this binary.
pub const LATEST_VERSION: u32 = 4;

/// Version a pre-versioning database has once rebuilt.
pub const REBUILT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Options and context
// ---------------------------------------------------------------------------

/// Per-run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Key of the version row.
    pub component: String,
    pub target_version: u32,
    /// Drop legacy tables once their data has been carried over.
    pub drop_legacy_tables: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            component: DEFAULT_COMPONENT.to_string(),
            target_version: LATEST_VERSION,
            drop_legacy_tables: true,
        }
    }
}

/// Everything a version transition may use.
pub struct MigrationContext<'a> {
    pub session: &'a Session<'a>,
    pub options: &'a MigrationOptions,
    pub scripts: &'a ScriptLoader,
    pub boards: &'a dyn BoardResolver,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One transition from version `n` to `n + 1`.
pub trait VersionMigration {
    fn description(&self) -> &str;

    /// Apply the transition. Must be safe to re-run after a partial failure.
    ///
    /// # Errors
    ///
    /// Any failure; the version row is then left at `n`.
    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()>;
}

struct FnMigration<F> {
    description: String,
    body: F,
}

impl<F> VersionMigration for FnMigration<F>
where
    F: Fn(&MigrationContext<'_>) -> Result<()>,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        (self.body)(ctx)
    }
}

/// Transitions keyed by the version they start from.
#[derive(Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<u32, Box<dyn VersionMigration>>,
}

impl MigrationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The transitions shipped with this crate, up to [`LATEST_VERSION`].
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(1, DialectStepsMigration);
        registry.register(2, FilterTablesMigration);
        registry.register(3, LegacyRulesMigration);
        registry
    }

    /// Register the transition `from -> from + 1`, replacing any existing one.
    pub fn register(&mut self, from: u32, migration: impl VersionMigration + 'static) -> &mut Self {
        self.migrations.insert(from, Box::new(migration));
        self
    }

    pub fn register_fn<F>(&mut self, from: u32, description: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(&MigrationContext<'_>) -> Result<()> + 'static,
    {
        self.register(
            from,
            FnMigration {
                description: description.into(),
                body,
            },
        )
    }

    #[must_use]
    pub fn get(&self, from: u32) -> Option<&dyn VersionMigration> {
        self.migrations.get(&from).map(AsRef::as_ref)
    }

    /// Highest version reachable through consecutive transitions from the
    /// lowest registered one.
    #[must_use]
    pub fn latest(&self) -> Option<u32> {
        let mut versions = self.migrations.keys().copied();
        let mut latest = versions.next()? + 1;
        for from in versions {
            if from != latest {
                break;
            }
            latest = from + 1;
        }
        Some(latest)
    }

    /// Check that every transition from `from` to `to` is registered.
    ///
    /// # Errors
    ///
    /// [`MigrationError::MissingMigration`] naming the first gap.
    pub fn ensure_path(&self, from: u32, to: u32) -> Result<()> {
        match (from..to).find(|v| !self.migrations.contains_key(v)) {
            Some(gap) => Err(MigrationError::MissingMigration { from: gap }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Standard transitions
// ---------------------------------------------------------------------------

/// 1 -> 2: the dialect's column, type and collation steps.
pub struct DialectStepsMigration;

impl VersionMigration for DialectStepsMigration {
    fn description(&self) -> &str {
        "dialect schema steps"
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let steps = steps_for(ctx.session.dialect()).steps();
        run_steps(ctx.session, &steps).map(|_| ())
    }
}

/// 2 -> 3: create the unified filter tables.
pub struct FilterTablesMigration;

impl VersionMigration for FilterTablesMigration {
    fn description(&self) -> &str {
        "create filter tables"
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        if ctx.session.probe().table_exists("DBPREFIXfilters")? {
            return Ok(());
        }
        let statements = ctx.scripts.statements(&init_script(ctx.session.dialect()))?;
        for statement in statements
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE DBPREFIXfilter"))
        {
            ctx.session.exec(statement, &[])?;
        }
        Ok(())
    }
}

/// 3 -> 4: fold the legacy ban and wordfilter tables into filters.
pub struct LegacyRulesMigration;

impl VersionMigration for LegacyRulesMigration {
    fn description(&self) -> &str {
        "transform legacy bans and wordfilters"
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        LegacyRuleTransformer::new(ctx.session, ctx.boards)
            .drop_legacy_tables(ctx.options.drop_legacy_tables)
            .run()
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// One completed version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: u32,
    pub to: u32,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub initial: SchemaState,
    /// Version recorded when the run finished.
    pub version: u32,
    /// The current schema was created from scratch.
    pub provisioned: bool,
    pub rebuild: Option<RebuildReport>,
    pub transitions: Vec<Transition>,
    pub elapsed: std::time::Duration,
}

impl MigrationOutcome {
    /// Nothing had to change.
    #[must_use]
    pub fn was_up_to_date(&self) -> bool {
        matches!(self.initial, SchemaState::UpToDate(_))
    }
}

type TransitionHook<'a> = Box<dyn Fn(Transition) + 'a>;

pub struct MigrationOrchestrator<'a> {
    session: &'a Session<'a>,
    scripts: &'a ScriptLoader,
    registry: &'a MigrationRegistry,
    boards: &'a dyn BoardResolver,
    options: MigrationOptions,
    on_transition: Option<TransitionHook<'a>>,
}

impl<'a> MigrationOrchestrator<'a> {
    #[must_use]
    pub fn new(
        session: &'a Session<'a>,
        scripts: &'a ScriptLoader,
        registry: &'a MigrationRegistry,
        boards: &'a dyn BoardResolver,
    ) -> Self {
        Self {
            session,
            scripts,
            registry,
            boards,
            options: MigrationOptions::default(),
            on_transition: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Called before each version transition starts.
    #[must_use]
    pub fn on_transition(mut self, hook: impl Fn(Transition) + 'a) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub const fn options(&self) -> &MigrationOptions {
        &self.options
    }

    fn oracle(&self) -> SchemaVersionOracle<'a> {
        SchemaVersionOracle::new(self.session, self.options.target_version)
            .with_component(self.options.component.clone())
    }

    /// Classify without changing anything.
    ///
    /// # Errors
    ///
    /// As [`SchemaVersionOracle::classify`].
    pub fn status(&self) -> Result<SchemaState> {
        self.oracle().classify()
    }

    /// Bring the database to the target version.
    ///
    /// # Errors
    ///
    /// [`MigrationError::AheadOfTarget`] and [`MigrationError::Corrupted`]
    /// before any write, [`MigrationError::MissingMigration`] if the path to
    /// the target has a gap (also before any write), or the first failing
    /// transition. Transitions that completed keep their version row.
    pub fn run(&self) -> Result<MigrationOutcome> {
        let start = Instant::now();
        let target = self.options.target_version;
        let initial = self.oracle().classify()?;
        let mut outcome = MigrationOutcome {
            initial,
            version: target,
            provisioned: false,
            rebuild: None,
            transitions: Vec::new(),
            elapsed: start.elapsed(),
        };

        match initial {
            SchemaState::Ahead(found) => {
                return Err(MigrationError::AheadOfTarget { found, target });
            }
            SchemaState::Corrupted(why) => {
                return Err(MigrationError::Corrupted {
                    prefix: self.session.prefix().to_string(),
                    detail: why.describe().to_string(),
                });
            }
            SchemaState::UpToDate(version) => {
                info!(version, "database is up to date");
            }
            SchemaState::Clean => {
                self.provision()?;
                outcome.provisioned = true;
            }
            SchemaState::PreVersioning => {
                self.registry.ensure_path(REBUILT_VERSION, target)?;
                info!("Rebuilding pre-versioning database as version {REBUILT_VERSION}");
                let report = guarded(|| {
                    PreVersioningMigrator::new(self.session, self.scripts)
                        .drop_legacy_tables(self.options.drop_legacy_tables)
                        .run()
                })
                .map_err(|e| e.in_step("pre-versioning rebuild"))?;
                self.write_version(REBUILT_VERSION)?;
                outcome.rebuild = Some(report);
                outcome.transitions = self.walk(REBUILT_VERSION, target)?;
            }
            SchemaState::Behind(version) => {
                self.registry.ensure_path(version, target)?;
                outcome.transitions = self.walk(version, target)?;
            }
        }

        outcome.elapsed = start.elapsed();
        Ok(outcome)
    }

    fn walk(&self, from: u32, to: u32) -> Result<Vec<Transition>> {
        let ctx = MigrationContext {
            session: self.session,
            options: &self.options,
            scripts: self.scripts,
            boards: self.boards,
        };
        let mut done = Vec::new();
        for version in from..to {
            let migration = self
                .registry
                .get(version)
                .ok_or(MigrationError::MissingMigration { from: version })?;
            let transition = Transition {
                from: version,
                to: version + 1,
            };
            if let Some(hook) = &self.on_transition {
                hook(transition);
            }
            info!(
                description = migration.description(),
                "Migrating database from version {} to version {}",
                transition.from,
                transition.to
            );
            guarded(|| migration.migrate(&ctx))
                .map_err(|e| e.in_step(format!("version {} -> {}", transition.from, transition.to)))?;
            self.bump_version(transition.to)?;
            done.push(transition);
        }
        Ok(done)
    }

    fn provision(&self) -> Result<()> {
        let script = init_script(self.session.dialect());
        info!(script = %script, version = self.options.target_version, "provisioning clean database");
        guarded(|| self.scripts.run(self.session, &script).map(|_| ()))
            .map_err(|e| e.in_step("provision clean database"))?;
        self.write_version(self.options.target_version)
    }

    /// Replace the component's version row.
    fn write_version(&self, version: u32) -> Result<()> {
        let component = self.options.component.as_str();
        self.session.transaction(|s| {
            s.exec(
                "DELETE FROM DBPREFIXdatabase_version WHERE component = ?",
                &[component.into()],
            )?;
            s.exec(
                "INSERT INTO DBPREFIXdatabase_version(component, version) VALUES (?, ?)",
                &[component.into(), version.into()],
            )?;
            Ok(())
        })
    }

    fn bump_version(&self, version: u32) -> Result<()> {
        self.session.exec(
            "UPDATE DBPREFIXdatabase_version SET version = ? WHERE component = ?",
            &[version.into(), self.options.component.as_str().into()],
        )?;
        Ok(())
    }
}

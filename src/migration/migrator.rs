//! Migrator - Core migration execution engine

use crate::backend::Backend;
use crate::config::MigrateConfig;
use crate::migration::apply::{AppliedMigration, MigrationExecutor};
use crate::migration::cancel::CancellationToken;
use crate::migration::file::{MigrationCatalog, MigrationDescriptor};
use crate::migration::lock::MigrationLockGuard;
use crate::migration::record::{AppliedRecord, RecordType};
use crate::migration::schema::{SchemaContext, SchemaTarget};
use crate::migration::state_table::{HistoryTable, NewRecord, MAX_VERSION_LEN};
use crate::migration::status::{current_version, first_failed, plan, MigrationStatus, PlanOptions};
use crate::migration::version::MigrationVersion;
use crate::migration::MigrationError;
use serde::Serialize;
use std::collections::HashMap;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigratorState {
    Idle,
    SchemaResolving,
    LockAcquiring,
    HistoryLoading,
    Planning,
    Applying,
    Releasing,
    Done,
    Failed,
}

/// Tracks and logs the state of a single run
struct RunState(MigratorState);

impl RunState {
    fn new() -> Self {
        RunState(MigratorState::Idle)
    }

    fn advance(&mut self, next: MigratorState) {
        log::debug!("Migrator state: {:?} -> {:?}", self.0, next);
        self.0 = next;
    }
}

/// Outcome of a successful `migrate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateResult {
    pub applied_count: usize,
    /// Highest successfully applied version after the run, baseline included
    pub target_schema_version: Option<MigrationVersion>,
    /// Schema hosting the history table
    pub schema: String,
    pub applied: Vec<AppliedMigration>,
}

/// What `repair` changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub schema: String,
    pub removed_failed: u64,
    /// Applied migrations whose checksum or description was realigned
    pub realigned: Vec<String>,
}

/// Everything a mutating operation holds while it runs
struct LockedSession<'a> {
    target: SchemaTarget,
    table: HistoryTable,
    guard: MigrationLockGuard<'a>,
    installed_by: String,
    created_schemas: Vec<String>,
}

/// Core migration execution engine
///
/// The `Migrator` resolves migrations from the configured locations, compares them
/// with the history table and applies what is pending, one run at a time per
/// history table.
pub struct Migrator {
    config: MigrateConfig,
    catalog: MigrationCatalog,
}

impl Migrator {
    /// Create a new Migrator from configuration
    pub fn new(config: MigrateConfig) -> Result<Self, MigrationError> {
        config.validate()?;
        let catalog = MigrationCatalog::from_config(&config)?;
        Ok(Self { config, catalog })
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// Discover all migrations in application order
    pub fn discover_migrations(&self) -> Result<Vec<MigrationDescriptor>, MigrationError> {
        self.catalog.resolve()
    }

    /// Apply all pending migrations
    ///
    /// # Errors
    ///
    /// Catalog errors are raised before the database is touched. Execution errors
    /// keep every migration committed before the failure and record the failed one.
    /// The lock is released on every path.
    pub fn migrate(&self, backend: &dyn Backend) -> Result<MigrateResult, MigrationError> {
        self.migrate_with_cancel(backend, CancellationToken::new())
    }

    /// Apply all pending migrations, stopping at the next statement boundary once
    /// `token` is cancelled
    pub fn migrate_with_cancel(
        &self,
        backend: &dyn Backend,
        token: CancellationToken,
    ) -> Result<MigrateResult, MigrationError> {
        let mut state = RunState::new();
        let resolved = self.catalog.resolve()?;
        log::debug!("Resolved {} migration(s)", resolved.len());

        let mut session = match self.lock_session(backend, &mut state) {
            Ok(session) => session,
            Err(e) => {
                state.advance(MigratorState::Failed);
                return Err(e);
            }
        };

        let outcome = self.run(backend, &session, &resolved, token, &mut state);

        state.advance(MigratorState::Releasing);
        let released = session.guard.release();
        match (outcome, released) {
            (Ok(result), Ok(())) => {
                state.advance(MigratorState::Done);
                if result.applied_count == 0 {
                    log::info!(
                        "Schema {} is up to date (version {})",
                        result.schema,
                        display_version(result.target_schema_version.as_ref())
                    );
                } else {
                    log::info!(
                        "Successfully applied {} migration(s) to schema {}, now at version {}",
                        result.applied_count,
                        result.schema,
                        display_version(result.target_schema_version.as_ref())
                    );
                }
                Ok(result)
            }
            (Ok(_), Err(e)) => {
                state.advance(MigratorState::Failed);
                Err(e)
            }
            (Err(e), released) => {
                if let Err(release_error) = released {
                    log::warn!("Failed to release migration lock: {}", release_error);
                }
                state.advance(MigratorState::Failed);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        backend: &dyn Backend,
        session: &LockedSession<'_>,
        resolved: &[MigrationDescriptor],
        token: CancellationToken,
        state: &mut RunState,
    ) -> Result<MigrateResult, MigrationError> {
        state.advance(MigratorState::HistoryLoading);
        let table = &session.table;
        let mut applied = table.load_applied(backend)?;

        if let Some(failed) = first_failed(&applied) {
            return Err(MigrationError::FailedMigration {
                version: failed.version.as_ref().map(ToString::to_string),
                description: failed.description.clone(),
            });
        }

        if applied.is_empty() {
            let mut wrote = false;
            if !session.created_schemas.is_empty() {
                self.insert_schema_marker(backend, session)?;
                wrote = true;
            }
            if let Some(version) = &self.config.baseline_version {
                let version = parse_baseline(version)?;
                self.insert_baseline(backend, table, &version, &session.installed_by)?;
                wrote = true;
            }
            if wrote {
                applied = table.load_applied(backend)?;
            }
        }

        state.advance(MigratorState::Planning);
        let options = PlanOptions {
            out_of_order: self.config.out_of_order,
            validate: self.config.validate_on_migrate,
            ignore_missing_migrations: self.config.ignore_missing_migrations,
        };
        let plan = plan(resolved, &applied, options)?;
        log::info!(
            "Current version of schema {}: {}",
            session.target.history_schema,
            display_version(plan.current_version.as_ref())
        );

        state.advance(MigratorState::Applying);
        let executed = MigrationExecutor::new(backend, table, session.installed_by.clone())
            .with_cancellation(token)
            .apply_all(&plan.pending)?;

        let target_schema_version = if executed.is_empty() {
            plan.current_version
        } else {
            current_version(&table.load_applied(backend)?)
        };
        Ok(MigrateResult {
            applied_count: executed.len(),
            target_schema_version,
            schema: session.target.history_schema.clone(),
            applied: executed,
        })
    }

    /// Report every resolved and applied migration; never writes to the database
    pub fn info(&self, backend: &dyn Backend) -> Result<MigrationStatus, MigrationError> {
        let (resolved, target, applied) = self.read_history(backend)?;
        Ok(MigrationStatus::build(
            target.history_schema,
            &resolved,
            &applied,
            self.config.out_of_order,
        ))
    }

    /// Check resolved migrations against the history without applying anything
    ///
    /// Pending migrations are fine; checksum drift, failed rows, missing and
    /// out-of-order migrations are not.
    pub fn validate(&self, backend: &dyn Backend) -> Result<(), MigrationError> {
        let (resolved, target, applied) = self.read_history(backend)?;
        if let Some(failed) = first_failed(&applied) {
            return Err(MigrationError::FailedMigration {
                version: failed.version.as_ref().map(ToString::to_string),
                description: failed.description.clone(),
            });
        }
        let options = PlanOptions {
            out_of_order: self.config.out_of_order,
            validate: true,
            ignore_missing_migrations: self.config.ignore_missing_migrations,
        };
        let plan = plan(&resolved, &applied, options)?;
        log::info!(
            "Successfully validated {} migration(s) against schema {} ({} pending)",
            resolved.len(),
            target.history_schema,
            plan.pending.len()
        );
        Ok(())
    }

    /// Mark an existing database as being at the configured baseline version
    ///
    /// Uses `baseline_version`, or `1` when none is configured.
    pub fn baseline(&self, backend: &dyn Backend) -> Result<MigrationVersion, MigrationError> {
        let version = parse_baseline(self.config.baseline_version.as_deref().unwrap_or("1"))?;
        let mut state = RunState::new();
        let mut session = self.lock_session(backend, &mut state)?;

        state.advance(MigratorState::HistoryLoading);
        let applied = session.table.load_applied(backend)?;
        if let Some(existing) = applied.iter().find(|r| r.kind != RecordType::Schema) {
            return Err(MigrationError::Validation(format!(
                "{} already contains applied migrations (first: {}); baseline needs an empty history",
                session.table.qualified_name(),
                describe(existing)
            )));
        }
        if applied.is_empty() && !session.created_schemas.is_empty() {
            self.insert_schema_marker(backend, &session)?;
        }
        self.insert_baseline(backend, &session.table, &version, &session.installed_by)?;
        log::info!(
            "Baselined schema {} at version {}",
            session.target.history_schema,
            version
        );

        state.advance(MigratorState::Releasing);
        session.guard.release()?;
        state.advance(MigratorState::Done);
        Ok(version)
    }

    /// Remove failed rows and realign applied checksums with the resolved scripts
    pub fn repair(&self, backend: &dyn Backend) -> Result<RepairReport, MigrationError> {
        let resolved = self.catalog.resolve()?;
        let mut state = RunState::new();
        let mut session = self.lock_session(backend, &mut state)?;
        let table = &session.table;

        state.advance(MigratorState::HistoryLoading);
        let removed_failed = table.delete_failed(backend)?;
        if removed_failed > 0 {
            log::info!("Removed {} failed migration row(s) from {}", removed_failed, table.qualified_name());
        }

        let by_version: HashMap<&MigrationVersion, &MigrationDescriptor> = resolved
            .iter()
            .filter_map(|m| m.version.as_ref().map(|v| (v, m)))
            .collect();
        let mut realigned = Vec::new();
        for record in table.load_applied(backend)?.iter().filter(|r| r.is_versioned()) {
            let Some(migration) = record.version.as_ref().and_then(|v| by_version.get(v)) else {
                continue;
            };
            if record.checksum == Some(migration.checksum) && record.description == migration.description {
                continue;
            }
            table.update_checksum(
                backend,
                record.installed_rank,
                Some(migration.checksum),
                &migration.description,
            )?;
            log::info!("Repaired checksum of {}", migration);
            realigned.push(migration.to_string());
        }

        let report = RepairReport {
            schema: session.target.history_schema.clone(),
            removed_failed,
            realigned,
        };
        state.advance(MigratorState::Releasing);
        session.guard.release()?;
        state.advance(MigratorState::Done);
        Ok(report)
    }

    /// Resolve the schema, take the lock, then create schemas and the history table
    fn lock_session<'a>(
        &self,
        backend: &'a dyn Backend,
        state: &mut RunState,
    ) -> Result<LockedSession<'a>, MigrationError> {
        state.advance(MigratorState::SchemaResolving);
        let target = SchemaContext::resolve(backend, &self.config.schemas, self.config.create_schemas)?;
        let table = HistoryTable::new(backend.dialect(), target.history_schema.clone(), self.config.table.clone());
        let installed_by = self.installed_by(backend)?;

        let mut created_schemas = Vec::new();
        // The sentinel-row lock lives in the history table, so its schema must exist first
        if !backend.capabilities().advisory_locks && target.history_schema_missing() {
            create_schema(backend, &target.history_schema)?;
            created_schemas.push(target.history_schema.clone());
        }

        state.advance(MigratorState::LockAcquiring);
        let guard = MigrationLockGuard::acquire(backend, &table, self.config.lock_timeout(), &installed_by)?;

        for schema in target.missing.iter() {
            if created_schemas.contains(schema) {
                continue;
            }
            // Another run may have created it while we waited for the lock
            if backend.schema_exists(schema)? {
                continue;
            }
            create_schema(backend, schema)?;
            created_schemas.push(schema.clone());
        }
        table.ensure_exists(backend)?;

        Ok(LockedSession {
            target,
            table,
            guard,
            installed_by,
            created_schemas,
        })
    }

    fn read_history(
        &self,
        backend: &dyn Backend,
    ) -> Result<(Vec<MigrationDescriptor>, SchemaTarget, Vec<AppliedRecord>), MigrationError> {
        let resolved = self.catalog.resolve()?;
        let target = SchemaContext::resolve(backend, &self.config.schemas, true)?;
        let table = HistoryTable::new(backend.dialect(), target.history_schema.clone(), self.config.table.clone());
        let applied = if target.history_schema_missing() || !table.exists(backend)? {
            Vec::new()
        } else {
            table.load_applied(backend)?
        };
        Ok((resolved, target, applied))
    }

    fn installed_by(&self, backend: &dyn Backend) -> Result<String, MigrationError> {
        if let Some(user) = &self.config.installed_by {
            return Ok(user.clone());
        }
        Ok(backend.current_user()?.unwrap_or_default())
    }

    fn insert_schema_marker(&self, backend: &dyn Backend, session: &LockedSession<'_>) -> Result<(), MigrationError> {
        let names = session
            .created_schemas
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(",");
        session.table.record(
            backend,
            &NewRecord {
                version: None,
                description: "<< Tidemark Schema Creation >>".to_string(),
                kind: RecordType::Schema,
                script: names,
                checksum: None,
                installed_by: session.installed_by.clone(),
                execution_time_ms: 0,
                success: true,
            },
        )?;
        Ok(())
    }

    fn insert_baseline(
        &self,
        backend: &dyn Backend,
        table: &HistoryTable,
        version: &MigrationVersion,
        installed_by: &str,
    ) -> Result<(), MigrationError> {
        log::info!("Creating baseline at version {} in {}", version, table.qualified_name());
        table.record(
            backend,
            &NewRecord {
                version: Some(version.to_string()),
                description: self.config.baseline_description.clone(),
                kind: RecordType::Baseline,
                script: self.config.baseline_description.clone(),
                checksum: None,
                installed_by: installed_by.to_string(),
                execution_time_ms: 0,
                success: true,
            },
        )?;
        Ok(())
    }
}

fn create_schema(backend: &dyn Backend, schema: &str) -> Result<(), MigrationError> {
    log::info!("Creating schema {}", schema);
    backend
        .create_schema(schema)
        .map_err(|e| MigrationError::SchemaResolution(format!("could not create schema '{schema}': {e}")))
}

fn parse_baseline(version: &str) -> Result<MigrationVersion, MigrationError> {
    let parsed = MigrationVersion::parse(version)
        .map_err(|e| MigrationError::Config(format!("invalid baseline version '{version}': {e}")))?;
    if parsed.to_string().chars().count() > MAX_VERSION_LEN {
        return Err(MigrationError::Config(format!(
            "baseline version '{version}' is longer than {MAX_VERSION_LEN} characters"
        )));
    }
    Ok(parsed)
}

fn display_version(version: Option<&MigrationVersion>) -> String {
    version.map_or_else(|| "<< Empty Schema >>".to_string(), ToString::to_string)
}

fn describe(record: &AppliedRecord) -> String {
    match &record.version {
        Some(v) => format!("{} - {}", v, record.description),
        None => record.description.clone(),
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::migration::lock::is_migration_lock_held;
    use crate::migration::status::MigrationState;
    use std::fs;
    use std::path::Path;
    use std::thread;

    fn write(dir: &Path, name: &str, sql: &str) {
        fs::write(dir.join(name), sql).unwrap();
    }

    fn config(dir: &Path) -> MigrateConfig {
        MigrateConfig::new()
            .with_locations([dir.display().to_string()])
            .with_installed_by("tester")
    }

    fn history(backend: &SqliteBackend) -> Vec<AppliedRecord> {
        HistoryTable::new(backend.dialect(), "main", crate::config::DEFAULT_TABLE)
            .load_applied(backend)
            .unwrap()
    }

    fn versions(records: &[AppliedRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.version.as_ref().map_or_else(|| r.description.clone(), ToString::to_string))
            .collect()
    }

    #[test]
    fn test_migrate_applies_in_version_order_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V2__add_posts.sql", "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));");
        write(dir.path(), "V1__create_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY);");
        write(dir.path(), "V1_1__add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT;");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path())).unwrap();

        let first = migrator.migrate(&backend).unwrap();
        assert_eq!(first.applied_count, 3);
        assert_eq!(first.schema, "main");
        assert_eq!(first.target_schema_version.unwrap().to_string(), "2");
        assert_eq!(versions(&history(&backend)), vec!["1", "1.1", "2"]);

        let second = migrator.migrate(&backend).unwrap();
        assert_eq!(second.applied_count, 0);
        assert_eq!(second.target_schema_version.unwrap().to_string(), "2");
        assert_eq!(history(&backend).len(), 3);
        assert!(!is_migration_lock_held(&backend, &HistoryTable::new(backend.dialect(), "main", crate::config::DEFAULT_TABLE)).unwrap());
    }

    #[test]
    fn test_checksum_drift_blocks_until_repaired() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path())).unwrap();
        migrator.migrate(&backend).unwrap();

        write(dir.path(), "V1__init.sql", "CREATE TABLE t (id INTEGER, name TEXT);");
        write(dir.path(), "V2__more.sql", "CREATE TABLE u (id INTEGER);");
        let migrator = Migrator::new(config(dir.path())).unwrap();
        let err = migrator.migrate(&backend).unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { ref version, .. } if version == "1"), "{err}");
        assert!(matches!(migrator.validate(&backend), Err(MigrationError::ChecksumMismatch { .. })));
        assert!(!backend.table_exists("main", "u").unwrap());

        let report = migrator.repair(&backend).unwrap();
        assert_eq!(report.removed_failed, 0);
        assert_eq!(report.realigned, vec!["1 - init"]);
        assert_eq!(migrator.migrate(&backend).unwrap().applied_count, 1);
    }

    #[test]
    fn test_failed_migration_is_recorded_and_blocks_until_repaired() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__ok.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "V2__broken.sql", "CREATE TABLE b (id INTEGER);\nINSERT INTO nope VALUES (1);");
        write(dir.path(), "V3__later.sql", "CREATE TABLE c (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path())).unwrap();

        let err = migrator.migrate(&backend).unwrap_err();
        assert!(
            matches!(err, MigrationError::Execution { applied_count: 1, ref version, .. } if version.as_deref() == Some("2")),
            "{err}"
        );
        assert!(!backend.table_exists("main", "b").unwrap());
        assert!(!backend.table_exists("main", "c").unwrap());

        let status = migrator.info(&backend).unwrap();
        assert_eq!(status.failed_count, 1);
        let failed = status.migrations.iter().find(|m| m.state == MigrationState::Failed).unwrap();
        assert_eq!(failed.version.as_ref().unwrap().to_string(), "2");

        let blocked = migrator.migrate(&backend).unwrap_err();
        assert!(matches!(blocked, MigrationError::FailedMigration { .. }), "{blocked}");

        write(dir.path(), "V2__broken.sql", "CREATE TABLE b (id INTEGER);");
        let migrator = Migrator::new(config(dir.path())).unwrap();
        assert_eq!(migrator.repair(&backend).unwrap().removed_failed, 1);
        let result = migrator.migrate(&backend).unwrap();
        assert_eq!(result.applied_count, 2);
        assert_eq!(versions(&history(&backend)), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_configured_baseline_skips_older_migrations() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "V2__two.sql", "CREATE TABLE two (id INTEGER);");
        write(dir.path(), "V3__three.sql", "CREATE TABLE three (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path()).with_baseline_version("2")).unwrap();

        let result = migrator.migrate(&backend).unwrap();
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.target_schema_version.unwrap().to_string(), "3");
        assert!(!backend.table_exists("main", "one").unwrap());

        let rows = history(&backend);
        assert_eq!(rows[0].kind, RecordType::Baseline);
        assert_eq!(rows[0].description, "<< Baseline >>");
        assert_eq!(versions(&rows), vec!["2", "3"]);

        let states: Vec<MigrationState> = migrator.info(&backend).unwrap().migrations.iter().map(|m| m.state).collect();
        assert_eq!(
            states,
            vec![
                MigrationState::Baseline,
                MigrationState::Success,
                MigrationState::BelowBaseline,
                MigrationState::BelowBaseline
            ]
        );
    }

    #[test]
    fn test_explicit_baseline_needs_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "V5__five.sql", "CREATE TABLE five (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path()).with_baseline_version("4")).unwrap();

        assert_eq!(migrator.baseline(&backend).unwrap().to_string(), "4");
        let err = migrator.baseline(&backend).unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)), "{err}");

        let result = migrator.migrate(&backend).unwrap();
        assert_eq!(result.applied_count, 1);
        assert!(backend.table_exists("main", "five").unwrap());
        assert!(!backend.table_exists("main", "one").unwrap());
    }

    #[test]
    fn test_repeatable_migrations_rerun_on_change() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__users.sql", "CREATE TABLE users (id INTEGER, active INTEGER);");
        write(
            dir.path(),
            "R__active_users.sql",
            "DROP VIEW IF EXISTS active_users;\nCREATE VIEW active_users AS SELECT id FROM users WHERE active = 1;",
        );
        let backend = SqliteBackend::open_in_memory().unwrap();

        let first = Migrator::new(config(dir.path())).unwrap().migrate(&backend).unwrap();
        assert_eq!(first.applied_count, 2);
        assert_eq!(first.applied[1].description, "active users");
        assert_eq!(Migrator::new(config(dir.path())).unwrap().migrate(&backend).unwrap().applied_count, 0);

        write(
            dir.path(),
            "R__active_users.sql",
            "DROP VIEW IF EXISTS active_users;\nCREATE VIEW active_users AS SELECT id, active FROM users WHERE active = 1;",
        );
        let migrator = Migrator::new(config(dir.path())).unwrap();
        assert_eq!(migrator.info(&backend).unwrap().pending_count, 1);
        assert_eq!(migrator.migrate(&backend).unwrap().applied_count, 1);

        let repeatable_rows = history(&backend).into_iter().filter(|r| r.is_repeatable()).count();
        assert_eq!(repeatable_rows, 2);
        let states: Vec<MigrationState> = migrator.info(&backend).unwrap().migrations.iter().map(|m| m.state).collect();
        assert_eq!(
            states,
            vec![MigrationState::Success, MigrationState::Superseded, MigrationState::Success]
        );
    }

    #[test]
    fn test_cancelled_run_applies_nothing_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path())).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = migrator.migrate_with_cancel(&backend, token).unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled { applied_count: 0 }), "{err}");
        assert!(history(&backend).is_empty());
        let table = HistoryTable::new(backend.dialect(), "main", crate::config::DEFAULT_TABLE);
        assert!(!is_migration_lock_held(&backend, &table).unwrap());

        assert_eq!(migrator.migrate(&backend).unwrap().applied_count, 1);
    }

    #[test]
    fn test_out_of_order_migration_needs_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "V3__three.sql", "CREATE TABLE three (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        Migrator::new(config(dir.path())).unwrap().migrate(&backend).unwrap();

        write(dir.path(), "V2__two.sql", "CREATE TABLE two (id INTEGER);");
        let strict = Migrator::new(config(dir.path())).unwrap();
        let err = strict.migrate(&backend).unwrap_err();
        assert!(matches!(err, MigrationError::Validation(ref m) if m.contains("2 - two")), "{err}");
        let ignored = strict.info(&backend).unwrap();
        assert!(ignored.migrations.iter().any(|m| m.state == MigrationState::Ignored));

        let lenient = Migrator::new(config(dir.path()).with_out_of_order(true)).unwrap();
        let result = lenient.migrate(&backend).unwrap();
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.target_schema_version.unwrap().to_string(), "3");
        assert_eq!(versions(&history(&backend)), vec!["1", "3", "2"]);
    }

    #[test]
    fn test_missing_migration_fails_validation_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "V2__two.sql", "CREATE TABLE two (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();
        Migrator::new(config(dir.path())).unwrap().migrate(&backend).unwrap();

        fs::remove_file(dir.path().join("V1__one.sql")).unwrap();
        let strict = Migrator::new(config(dir.path())).unwrap();
        assert!(matches!(strict.validate(&backend), Err(MigrationError::Validation(_))));

        let lenient = Migrator::new(config(dir.path()).with_ignore_missing_migrations(true)).unwrap();
        assert!(lenient.validate(&backend).is_ok());
        assert_eq!(lenient.migrate(&backend).unwrap().applied_count, 0);
    }

    #[test]
    fn test_info_is_read_only_on_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "R__view.sql", "CREATE VIEW v AS SELECT 1;");
        let backend = SqliteBackend::open_in_memory().unwrap();
        let migrator = Migrator::new(config(dir.path())).unwrap();

        let status = migrator.info(&backend).unwrap();
        assert_eq!(status.schema, "main");
        assert_eq!(status.pending_count, 2);
        assert!(status.migrations.iter().all(|m| m.state == MigrationState::Pending));
        assert_eq!(status.next_pending_version().unwrap().to_string(), "1");
        assert!(!backend.table_exists("main", crate::config::DEFAULT_TABLE).unwrap());
        assert!(migrator.validate(&backend).is_ok());
    }

    #[test]
    fn test_schema_selection_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();

        let explicit = Migrator::new(config(dir.path()).with_schemas(["main"])).unwrap();
        assert_eq!(explicit.migrate(&backend).unwrap().schema, "main");

        let other = Migrator::new(config(dir.path()).with_schemas(["reporting"])).unwrap();
        let err = other.migrate(&backend).unwrap_err();
        assert!(matches!(err, MigrationError::SchemaResolution(_)), "{err}");
    }

    #[test]
    fn test_catalog_errors_surface_before_touching_the_database() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "V1__one.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "V1__uno.sql", "CREATE TABLE uno (id INTEGER);");
        let backend = SqliteBackend::open_in_memory().unwrap();

        let err = Migrator::new(config(dir.path())).unwrap().migrate(&backend).unwrap_err();
        assert!(matches!(err, MigrationError::ConflictingVersion { .. }), "{err}");
        assert!(!backend.table_exists("main", crate::config::DEFAULT_TABLE).unwrap());
    }

    #[test]
    fn test_concurrent_runs_apply_each_migration_once() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        fs::create_dir(&migrations).unwrap();
        for i in 1..=5 {
            write(&migrations, &format!("V{i}__table_{i}.sql"), &format!("CREATE TABLE t{i} (id INTEGER);"));
        }
        let db = dir.path().join("app.db");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let db = db.clone();
                let cfg = config(&migrations);
                thread::spawn(move || {
                    let backend = SqliteBackend::open(&db).unwrap();
                    Migrator::new(cfg).unwrap().migrate(&backend).unwrap().applied_count
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 5);

        let backend = SqliteBackend::open(&db).unwrap();
        let rows = history(&backend);
        assert_eq!(versions(&rows), vec!["1", "2", "3", "4", "5"]);
        assert!(rows.iter().all(|r| r.success));
    }
}

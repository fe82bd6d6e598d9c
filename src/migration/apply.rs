//! Applying migrations
//!
//! Each migration runs in its own transaction when the backend has transactional
//! DDL and the script does not opt out. Its history row is written inside that
//! transaction, so a crash leaves either both or neither. Without a transaction the
//! row follows the statements as its own insert.

use crate::backend::Backend;
use crate::migration::cancel::CancellationToken;
use crate::migration::file::{MigrationDescriptor, MigrationKind};
use crate::migration::state_table::{HistoryTable, NewRecord};
use crate::migration::version::MigrationVersion;
use crate::migration::MigrationError;
use serde::Serialize;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// A migration applied by this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: MigrationKind,
    pub installed_rank: i32,
    pub execution_time_ms: i32,
    pub statements: usize,
    pub transactional: bool,
}

/// Runs pending migrations one by one against the history table
pub struct MigrationExecutor<'a> {
    backend: &'a dyn Backend,
    table: &'a HistoryTable,
    installed_by: String,
    cancel: CancellationToken,
}

/// How a single migration ended short of success
enum Interrupted {
    Failed(MigrationError),
    Cancelled,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(backend: &'a dyn Backend, table: &'a HistoryTable, installed_by: impl Into<String>) -> Self {
        Self {
            backend,
            table,
            installed_by: installed_by.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Apply `pending` in order, stopping at the first failure
    ///
    /// Migrations applied before a failure stay applied; the error carries how many.
    pub fn apply_all(&self, pending: &[MigrationDescriptor]) -> Result<Vec<AppliedMigration>, MigrationError> {
        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            if self.cancel.is_cancelled() {
                log::warn!("Migration run cancelled before {}", migration);
                return Err(MigrationError::Cancelled {
                    applied_count: applied.len(),
                });
            }
            match self.apply(migration) {
                Ok(done) => applied.push(done),
                Err(Interrupted::Cancelled) => {
                    return Err(MigrationError::Cancelled {
                        applied_count: applied.len(),
                    })
                }
                Err(Interrupted::Failed(MigrationError::Execution {
                    version,
                    description,
                    statement,
                    cause,
                    ..
                })) => {
                    return Err(MigrationError::Execution {
                        version,
                        description,
                        statement,
                        cause,
                        applied_count: applied.len(),
                    })
                }
                Err(Interrupted::Failed(e)) => return Err(e),
            }
        }
        Ok(applied)
    }

    fn apply(&self, migration: &MigrationDescriptor) -> Result<AppliedMigration, Interrupted> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::apply_migration_span(
            self.table.schema(),
            &migration.version_string().unwrap_or_default(),
            &migration.description,
        )
        .entered();

        let script = migration
            .load_script(self.backend.dialect())
            .map_err(Interrupted::Failed)?;
        let use_tx = script.transactional && self.backend.capabilities().transactional_ddl;
        if !script.transactional {
            log::debug!("Migrating {} without a transaction", migration);
        }

        let start = Instant::now();
        if use_tx {
            self.backend
                .begin()
                .map_err(|e| Interrupted::Failed(e.into()))?;
        }

        for (index, statement) in script.statements.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(self.abandon(migration, use_tx, index, start.elapsed()));
            }
            if let Err(cause) = self.backend.execute_script_statement(statement) {
                if use_tx {
                    self.rollback(migration);
                }
                self.record_failure(migration, start.elapsed());
                return Err(Interrupted::Failed(MigrationError::Execution {
                    version: migration.version_string(),
                    description: migration.description.clone(),
                    statement: statement.clone(),
                    cause,
                    applied_count: 0,
                }));
            }
        }

        let elapsed = start.elapsed();
        let entry = self.entry(migration, elapsed, true);
        let rank = match self.table.record(self.backend, &entry) {
            Ok(rank) => rank,
            Err(e) => {
                if use_tx {
                    self.rollback(migration);
                }
                return Err(Interrupted::Failed(e));
            }
        };
        if use_tx {
            if let Err(e) = self.backend.commit() {
                self.rollback(migration);
                return Err(Interrupted::Failed(e.into()));
            }
        }

        #[cfg(feature = "metrics")]
        METRICS.record_migration_applied(self.table.schema(), elapsed);
        log::info!(
            "Migrated {} to {} ({} ms)",
            self.table.schema(),
            migration,
            entry.execution_time_ms
        );

        Ok(AppliedMigration {
            version: migration.version.clone(),
            description: migration.description.clone(),
            kind: migration.kind,
            installed_rank: rank,
            execution_time_ms: entry.execution_time_ms,
            statements: script.statements.len(),
            transactional: use_tx,
        })
    }

    /// Stop at a statement boundary after cancellation
    ///
    /// A transaction is rolled back and leaves no trace. Statements already run
    /// outside a transaction cannot be undone, so that migration is recorded as failed.
    fn abandon(&self, migration: &MigrationDescriptor, use_tx: bool, executed: usize, elapsed: Duration) -> Interrupted {
        log::warn!(
            "Migration {} cancelled after {} statement(s)",
            migration,
            executed
        );
        if use_tx {
            self.rollback(migration);
        } else if executed > 0 {
            self.record_failure(migration, elapsed);
        }
        Interrupted::Cancelled
    }

    fn rollback(&self, migration: &MigrationDescriptor) {
        if let Err(e) = self.backend.rollback() {
            log::warn!("Rollback of {} failed: {}", migration, e);
        }
    }

    fn record_failure(&self, migration: &MigrationDescriptor, elapsed: Duration) {
        #[cfg(feature = "metrics")]
        METRICS.record_migration_failed(self.table.schema());
        let entry = self.entry(migration, elapsed, false);
        if let Err(e) = self.table.mark_failed(self.backend, &entry) {
            log::warn!("Could not record failure of {}: {}", migration, e);
        }
    }

    fn entry(&self, migration: &MigrationDescriptor, elapsed: Duration, success: bool) -> NewRecord {
        NewRecord {
            version: migration.version_string(),
            description: migration.description.clone(),
            kind: migration.kind.into(),
            script: migration.script.clone(),
            checksum: Some(migration.checksum),
            installed_by: self.installed_by.clone(),
            execution_time_ms: i32::try_from(elapsed.as_millis()).unwrap_or(i32::MAX),
            success,
        }
    }
}

//! Migration locking
//!
//! One run at a time may hold the lock for a history table. Backends with advisory
//! locks use a session-level advisory lock keyed on the qualified table name;
//! others insert a sentinel row (`installed_rank = -1`) into the history table
//! itself, whose primary key makes the insert succeed for exactly one session.

use crate::backend::Backend;
use crate::migration::state_table::{HistoryTable, LOCK_RANK};
use crate::migration::MigrationError;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Advisory(i64),
    SentinelRow,
}

/// Advisory lock key for a history table
///
/// First eight bytes of `SHA-256("tidemark:<schema>.<table>")`, so runs against
/// different schemas of the same database do not block each other.
pub fn lock_key(schema: &str, table: &str) -> i64 {
    let hash = Sha256::digest(format!("tidemark:{schema}.{table}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    i64::from_be_bytes(bytes)
}

/// Held migration lock, released on drop
///
/// This is the run's only handle on the lock; every exit path of the owning run
/// drops it, so the lock never outlives the run.
pub struct MigrationLockGuard<'a> {
    backend: &'a dyn Backend,
    table: HistoryTable,
    strategy: LockStrategy,
    released: bool,
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the lock for `table`, polling until `timeout` elapses
    ///
    /// The sentinel-row strategy needs the history table, so it is created first
    /// when missing (`CREATE TABLE IF NOT EXISTS` tolerates concurrent creators).
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockTimeout` if the lock cannot be acquired.
    pub fn acquire(
        backend: &'a dyn Backend,
        table: &HistoryTable,
        timeout: Duration,
        owner: &str,
    ) -> Result<Self, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(table.schema(), table.table()).entered();

        let strategy = if backend.capabilities().advisory_locks {
            LockStrategy::Advisory(lock_key(table.schema(), table.table()))
        } else {
            table.ensure_exists(backend)?;
            LockStrategy::SentinelRow
        };

        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if try_lock(backend, table, strategy, owner)? {
                let waited = start.elapsed();
                #[cfg(feature = "metrics")]
                METRICS.observe_lock_wait(waited);
                log::debug!(
                    "Acquired migration lock on {} ({:?}) after {} attempt(s) in {:?}",
                    table.qualified_name(),
                    strategy,
                    attempts,
                    waited
                );
                return Ok(Self {
                    backend,
                    table: table.clone(),
                    strategy,
                    released: false,
                });
            }

            if start.elapsed() >= timeout {
                return Err(MigrationError::LockTimeout(timeout_message(table, strategy, timeout)));
            }
            if attempts == 1 {
                log::info!("Waiting for migration lock on {}", table.qualified_name());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Release the lock; calling it again is a no-op
    pub fn release(&mut self) -> Result<(), MigrationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match self.strategy {
            LockStrategy::Advisory(key) => self.backend.advisory_unlock(key)?,
            LockStrategy::SentinelRow => self.table.delete_lock_row(self.backend)?,
        }
        log::debug!("Released migration lock on {}", self.table.qualified_name());
        Ok(())
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!(
                "Failed to release migration lock on {}: {}",
                self.table.qualified_name(),
                e
            );
        }
    }
}

fn try_lock(
    backend: &dyn Backend,
    table: &HistoryTable,
    strategy: LockStrategy,
    owner: &str,
) -> Result<bool, MigrationError> {
    let attempt = match strategy {
        LockStrategy::Advisory(key) => backend.try_advisory_lock(key),
        LockStrategy::SentinelRow => table.insert_lock_row(backend, owner),
    };
    match attempt {
        Ok(acquired) => Ok(acquired),
        // Another session is mid-write on the table: same as "lock taken"
        Err(e) if backend.is_lock_contention(&e) => {
            log::debug!("Lock attempt on {} hit contention: {}", table.qualified_name(), e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn timeout_message(table: &HistoryTable, strategy: LockStrategy, timeout: Duration) -> String {
    match strategy {
        LockStrategy::Advisory(key) => format!(
            "Failed to acquire advisory lock {} for {} within {:?}",
            key,
            table.qualified_name(),
            timeout
        ),
        LockStrategy::SentinelRow => format!(
            "Failed to acquire migration lock for {} within {:?}. \
             If no other run is active, remove the stale lock row: DELETE FROM {} WHERE installed_rank = {}",
            table.qualified_name(),
            timeout,
            table.qualified_name(),
            LOCK_RANK
        ),
    }
}

/// Check whether a sentinel lock row is present
pub fn is_migration_lock_held(backend: &dyn Backend, table: &HistoryTable) -> Result<bool, MigrationError> {
    if !table.exists(backend)? {
        return Ok(false);
    }
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE installed_rank = {}",
        table.qualified_name(),
        LOCK_RANK
    );
    let count = backend
        .query(&sql, &[])?
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Ok(count > 0)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::{Dialect, SqliteBackend};

    fn history() -> HistoryTable {
        HistoryTable::new(Dialect::Sqlite, "main", "tidemark_schema_history")
    }

    #[test]
    fn test_lock_key_is_stable_and_schema_scoped() {
        assert_eq!(lock_key("app", "history"), lock_key("app", "history"));
        assert_ne!(lock_key("app", "history"), lock_key("audit", "history"));
    }

    #[test]
    fn test_sentinel_lock_acquire_and_release() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let table = history();

        let mut guard = MigrationLockGuard::acquire(&backend, &table, Duration::from_secs(1), "me").unwrap();
        assert_eq!(guard.strategy(), LockStrategy::SentinelRow);
        assert!(is_migration_lock_held(&backend, &table).unwrap());

        guard.release().unwrap();
        guard.release().unwrap();
        assert!(!is_migration_lock_held(&backend, &table).unwrap());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let table = history();
        {
            let _guard = MigrationLockGuard::acquire(&backend, &table, Duration::from_secs(1), "me").unwrap();
            assert!(is_migration_lock_held(&backend, &table).unwrap());
        }
        assert!(!is_migration_lock_held(&backend, &table).unwrap());
    }

    #[test]
    fn test_second_session_times_out_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let first = SqliteBackend::open(&path).unwrap();
        let second = SqliteBackend::open(&path).unwrap();
        let table = history();

        let guard = MigrationLockGuard::acquire(&first, &table, Duration::from_secs(1), "first").unwrap();
        let err = MigrationLockGuard::acquire(&second, &table, Duration::from_millis(300), "second")
            .err()
            .unwrap();
        assert!(matches!(err, MigrationError::LockTimeout(_)), "{err}");
        assert!(err.to_string().contains("installed_rank = -1"));

        drop(guard);
        assert!(MigrationLockGuard::acquire(&second, &table, Duration::from_secs(1), "second").is_ok());
    }
}

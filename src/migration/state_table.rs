//! Schema history table management
//!
//! The history table lives in the history schema resolved for the run and stores one
//! row per applied (or failed) migration:
//!
//! | column           | content                                         |
//! |------------------|-------------------------------------------------|
//! | `installed_rank` | order of application, assigned as `MAX + 1`     |
//! | `version`        | NULL for repeatable migrations                  |
//! | `description`    |                                                 |
//! | `type`           | `VERSIONED`, `REPEATABLE`, `BASELINE`, `SCHEMA` |
//! | `script`         | script path relative to its location            |
//! | `checksum`       | NULL for synthetic rows                         |
//! | `installed_by`   |                                                 |
//! | `installed_on`   | defaults to the current time                    |
//! | `execution_time` | milliseconds                                    |
//! | `success`        | `false` blocks further runs until repaired      |
//!
//! Rank `-1` is reserved for the sentinel lock row and is never returned by
//! [`HistoryTable::load_applied`].

use crate::backend::{Backend, Dialect, SqlValue};
use crate::migration::record::{AppliedRecord, RecordType};
use crate::migration::MigrationError;

/// Rank of the sentinel row used as a lock where advisory locks are unavailable
pub const LOCK_RANK: i32 = -1;

const COLUMNS: &str = "installed_rank, version, description, type, script, checksum, installed_by, installed_on, execution_time, success";

/// Column widths of the identity columns; longer names are rejected at discovery
pub const MAX_VERSION_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 200;
const MAX_SCRIPT_LEN: usize = 1000;
const MAX_INSTALLED_BY_LEN: usize = 100;

/// A row about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub version: Option<String>,
    pub description: String,
    pub kind: RecordType,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_by: String,
    pub execution_time_ms: i32,
    pub success: bool,
}

/// The history table of one schema
#[derive(Debug, Clone)]
pub struct HistoryTable {
    dialect: Dialect,
    schema: String,
    table: String,
    qualified: String,
}

impl HistoryTable {
    pub fn new(dialect: Dialect, schema: impl Into<String>, table: impl Into<String>) -> Self {
        let schema = schema.into();
        let table = table.into();
        let qualified = dialect.qualify(&schema, &table);
        Self {
            dialect,
            schema,
            table,
            qualified,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// `"schema"."table"`
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    fn p(&self, n: usize) -> String {
        self.dialect.placeholder(n)
    }

    pub fn create_table_sql(&self) -> String {
        match self.dialect {
            Dialect::Postgres => format!(
                r#"CREATE TABLE IF NOT EXISTS {q} (
    installed_rank INTEGER NOT NULL,
    version VARCHAR(50),
    description VARCHAR(200) NOT NULL,
    type VARCHAR(20) NOT NULL,
    script VARCHAR(1000) NOT NULL,
    checksum INTEGER,
    installed_by VARCHAR(100) NOT NULL,
    installed_on TIMESTAMP NOT NULL DEFAULT now(),
    execution_time INTEGER NOT NULL,
    success BOOLEAN NOT NULL,
    CONSTRAINT {pk} PRIMARY KEY (installed_rank)
)"#,
                q = self.qualified,
                pk = self.dialect.quote_identifier(&format!("{}_pk", self.table)),
            ),
            Dialect::Sqlite => format!(
                r#"CREATE TABLE IF NOT EXISTS {q} (
    installed_rank INT NOT NULL PRIMARY KEY,
    version VARCHAR(50),
    description VARCHAR(200) NOT NULL,
    type VARCHAR(20) NOT NULL,
    script VARCHAR(1000) NOT NULL,
    checksum INT,
    installed_by VARCHAR(100) NOT NULL,
    installed_on TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    execution_time INT NOT NULL,
    success BOOLEAN NOT NULL
)"#,
                q = self.qualified,
            ),
        }
    }

    /// Index on `success` so the failed-row check stays cheap
    pub fn create_index_sql(&self) -> String {
        let index = format!("{}_s_idx", self.table);
        match self.dialect {
            Dialect::Postgres => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (success)",
                self.dialect.quote_identifier(&index),
                self.qualified
            ),
            // SQLite qualifies the index name, not the table
            Dialect::Sqlite => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (success)",
                self.dialect.qualify(&self.schema, &index),
                self.dialect.quote_identifier(&self.table)
            ),
        }
    }

    pub fn exists(&self, backend: &dyn Backend) -> Result<bool, MigrationError> {
        Ok(backend.table_exists(&self.schema, &self.table)?)
    }

    /// Create the table and its index if absent; `true` when it was created
    ///
    /// Runs under the migration lock so concurrent first runs cannot race.
    pub fn ensure_exists(&self, backend: &dyn Backend) -> Result<bool, MigrationError> {
        if self.exists(backend)? {
            return Ok(false);
        }
        log::info!("Creating schema history table {}", self.qualified);
        backend.execute(&self.create_table_sql(), &[])?;
        backend.execute(&self.create_index_sql(), &[])?;
        Ok(true)
    }

    /// Every real row ordered by `installed_rank`
    pub fn load_applied(&self, backend: &dyn Backend) -> Result<Vec<AppliedRecord>, MigrationError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE installed_rank > 0 ORDER BY installed_rank",
            self.qualified
        );
        backend
            .query(&sql, &[])?
            .iter()
            .map(AppliedRecord::from_row)
            .collect()
    }

    /// Next `installed_rank`; only meaningful while holding the migration lock
    pub fn next_rank(&self, backend: &dyn Backend) -> Result<i32, MigrationError> {
        let sql = format!(
            "SELECT COALESCE(MAX(installed_rank), 0) + 1 FROM {} WHERE installed_rank > 0",
            self.qualified
        );
        backend
            .query(&sql, &[])?
            .first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i32)
            .ok_or_else(|| MigrationError::Validation(format!("could not compute next rank of {}", self.qualified)))
    }

    /// Append a row and return its rank
    ///
    /// Runs on whatever transaction the caller has open: inside the migration's own
    /// transaction on backends with transactional DDL, on its own otherwise.
    pub fn record(&self, backend: &dyn Backend, entry: &NewRecord) -> Result<i32, MigrationError> {
        let rank = self.next_rank(backend)?;
        let sql = format!(
            "INSERT INTO {} (installed_rank, version, description, type, script, checksum, installed_by, execution_time, success) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {})",
            self.qualified,
            self.p(1),
            self.p(2),
            self.p(3),
            self.p(4),
            self.p(5),
            self.p(6),
            self.p(7),
            self.p(8),
            self.p(9)
        );
        backend.execute(
            &sql,
            &[
                SqlValue::Int(Some(rank)),
                SqlValue::Text(entry.version.as_deref().map(|v| clip(v, MAX_VERSION_LEN))),
                SqlValue::text(clip(&entry.description, MAX_DESCRIPTION_LEN)),
                SqlValue::text(entry.kind.as_str()),
                SqlValue::text(clip(&entry.script, MAX_SCRIPT_LEN)),
                SqlValue::Int(entry.checksum),
                SqlValue::text(clip(&entry.installed_by, MAX_INSTALLED_BY_LEN)),
                SqlValue::Int(Some(entry.execution_time_ms)),
                SqlValue::Bool(Some(entry.success)),
            ],
        )?;
        Ok(rank)
    }

    /// Append a `success = false` row for a migration whose statements failed
    ///
    /// Call after the migration's transaction (if any) was rolled back.
    pub fn mark_failed(&self, backend: &dyn Backend, entry: &NewRecord) -> Result<i32, MigrationError> {
        let failed = NewRecord {
            success: false,
            ..entry.clone()
        };
        self.record(backend, &failed)
    }

    /// Remove failed rows; returns how many were deleted
    pub fn delete_failed(&self, backend: &dyn Backend) -> Result<u64, MigrationError> {
        let sql = format!(
            "DELETE FROM {} WHERE success = FALSE AND installed_rank > 0",
            self.qualified
        );
        Ok(backend.execute(&sql, &[])?)
    }

    /// Realign a row with the resolved script
    pub fn update_checksum(
        &self,
        backend: &dyn Backend,
        installed_rank: i32,
        checksum: Option<i32>,
        description: &str,
    ) -> Result<(), MigrationError> {
        let sql = format!(
            "UPDATE {} SET checksum = {}, description = {} WHERE installed_rank = {}",
            self.qualified,
            self.p(1),
            self.p(2),
            self.p(3)
        );
        backend.execute(
            &sql,
            &[
                SqlValue::Int(checksum),
                SqlValue::text(clip(description, MAX_DESCRIPTION_LEN)),
                SqlValue::Int(Some(installed_rank)),
            ],
        )?;
        Ok(())
    }

    /// Insert the sentinel lock row; `true` if this call created it
    pub fn insert_lock_row(&self, backend: &dyn Backend, owner: &str) -> Result<bool, crate::executor::DbError> {
        let sql = format!(
            "INSERT INTO {} (installed_rank, version, description, type, script, checksum, installed_by, execution_time, success) \
             VALUES ({LOCK_RANK}, NULL, 'tidemark lock', 'LOCK', '', NULL, {}, 0, TRUE) \
             ON CONFLICT (installed_rank) DO NOTHING",
            self.qualified,
            self.p(1)
        );
        Ok(backend.execute(&sql, &[SqlValue::text(clip(owner, MAX_INSTALLED_BY_LEN))])? == 1)
    }

    pub fn delete_lock_row(&self, backend: &dyn Backend) -> Result<(), crate::executor::DbError> {
        let sql = format!("DELETE FROM {} WHERE installed_rank = {LOCK_RANK}", self.qualified);
        backend.execute(&sql, &[]).map(|_| ())
    }
}

/// Truncate to at most `max` characters
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;

    fn entry(version: Option<&str>, description: &str, kind: RecordType) -> NewRecord {
        NewRecord {
            version: version.map(str::to_string),
            description: description.to_string(),
            kind,
            script: format!("{description}.sql"),
            checksum: Some(7),
            installed_by: "tester".to_string(),
            execution_time_ms: 3,
            success: true,
        }
    }

    fn setup() -> (SqliteBackend, HistoryTable) {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let table = HistoryTable::new(Dialect::Sqlite, "main", "tidemark_schema_history");
        (backend, table)
    }

    #[test]
    fn test_ensure_exists_is_idempotent() {
        let (backend, table) = setup();
        assert!(!table.exists(&backend).unwrap());
        assert!(table.ensure_exists(&backend).unwrap());
        assert!(!table.ensure_exists(&backend).unwrap());
        assert!(table.exists(&backend).unwrap());
    }

    #[test]
    fn test_record_assigns_increasing_ranks() {
        let (backend, table) = setup();
        table.ensure_exists(&backend).unwrap();

        assert_eq!(table.record(&backend, &entry(Some("1"), "a", RecordType::Versioned)).unwrap(), 1);
        assert_eq!(table.record(&backend, &entry(None, "views", RecordType::Repeatable)).unwrap(), 2);
        assert_eq!(table.mark_failed(&backend, &entry(Some("2"), "b", RecordType::Versioned)).unwrap(), 3);

        let applied = table.load_applied(&backend).unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[0].version.as_ref().unwrap().to_string(), "1");
        assert_eq!(applied[0].installed_by, "tester");
        assert!(applied[1].is_repeatable());
        assert!(applied[1].version.is_none());
        assert!(!applied[2].success);
    }

    #[test]
    fn test_delete_failed_and_update_checksum() {
        let (backend, table) = setup();
        table.ensure_exists(&backend).unwrap();
        table.record(&backend, &entry(Some("1"), "a", RecordType::Versioned)).unwrap();
        table.mark_failed(&backend, &entry(Some("2"), "b", RecordType::Versioned)).unwrap();

        assert_eq!(table.delete_failed(&backend).unwrap(), 1);
        table.update_checksum(&backend, 1, Some(99), "a renamed").unwrap();

        let applied = table.load_applied(&backend).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].checksum, Some(99));
        assert_eq!(applied[0].description, "a renamed");
    }

    #[test]
    fn test_lock_row_is_exclusive_and_hidden() {
        let (backend, table) = setup();
        table.ensure_exists(&backend).unwrap();

        assert!(table.insert_lock_row(&backend, "first").unwrap());
        assert!(!table.insert_lock_row(&backend, "second").unwrap());
        assert!(table.load_applied(&backend).unwrap().is_empty());
        assert_eq!(table.next_rank(&backend).unwrap(), 1);

        table.delete_lock_row(&backend).unwrap();
        assert!(table.insert_lock_row(&backend, "second").unwrap());
    }

    #[test]
    fn test_long_values_are_clipped() {
        let (backend, table) = setup();
        table.ensure_exists(&backend).unwrap();
        let long = "x".repeat(500);
        table.record(&backend, &entry(Some("1"), &long, RecordType::Versioned)).unwrap();
        let applied = table.load_applied(&backend).unwrap();
        assert_eq!(applied[0].description.len(), MAX_DESCRIPTION_LEN);
    }

    #[test]
    fn test_postgres_ddl_is_schema_qualified() {
        let table = HistoryTable::new(Dialect::Postgres, "app", "history");
        assert!(table.create_table_sql().starts_with("CREATE TABLE IF NOT EXISTS \"app\".\"history\""));
        assert_eq!(
            table.create_index_sql(),
            "CREATE INDEX IF NOT EXISTS \"history_s_idx\" ON \"app\".\"history\" (success)"
        );
    }
}

//! SQLite backend over `rusqlite`
//!
//! SQLite has a single writable namespace per connection (`main`), so the current
//! schema never changes and the engine serializes runs with the history table's
//! sentinel row instead of an advisory lock.

use super::{Backend, Capabilities, Dialect, SchemaAccess, SqlRow, SqlValue, TIMESTAMP_FORMAT};
use crate::executor::DbError;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::time::{Duration, Instant};

/// Schema name SQLite gives the primary database of a connection
pub const MAIN_SCHEMA: &str = "main";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(500);

const CAPABILITIES: Capabilities = Capabilities {
    transactional_ddl: true,
    advisory_locks: false,
    schema_switching: false,
};

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, installing a busy timeout
    pub fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn batch(&self, sql: &str) -> Result<(), DbError> {
        let start = Instant::now();
        let result = self.conn.execute_batch(sql).map_err(DbError::from);
        log::trace!("executed in {:?}: {}", start.elapsed(), sql.trim());
        result
    }
}

impl SchemaAccess for SqliteBackend {
    fn current_schema(&self) -> Result<Option<String>, DbError> {
        Ok(Some(MAIN_SCHEMA.to_string()))
    }

    fn set_current_schema(&self, schema: &str) -> Result<(), DbError> {
        if schema == MAIN_SCHEMA {
            return Ok(());
        }
        Err(DbError::Other(format!(
            "SQLite cannot switch the current schema to '{schema}'; only '{MAIN_SCHEMA}' is available"
        )))
    }

    fn schema_exists(&self, schema: &str) -> Result<bool, DbError> {
        let rows = self.query("PRAGMA database_list", &[])?;
        Ok(rows
            .iter()
            .any(|row| row.get(1).and_then(SqlValue::as_str) == Some(schema)))
    }

    fn create_schema(&self, schema: &str) -> Result<(), DbError> {
        Err(DbError::Other(format!(
            "SQLite cannot create schema '{schema}'; attach a database file under that name instead"
        )))
    }
}

impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::execute_query_span(sql).entered();

        let affected = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(to_value)))?;
        Ok(affected as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = crate::metrics::tracing_helpers::execute_query_span(sql).entered();

        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter().map(to_value)), |row| {
            (0..columns)
                .map(|i| row.get_ref(i).map(from_value_ref))
                .collect::<Result<SqlRow, _>>()
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    fn execute_script_statement(&self, sql: &str) -> Result<(), DbError> {
        // execute_batch tolerates statements that return rows (PRAGMA, SELECT)
        self.batch(sql)
    }

    fn begin(&self) -> Result<(), DbError> {
        // Take the write lock up front so a concurrent writer fails fast as busy
        self.batch("BEGIN IMMEDIATE")
    }

    fn commit(&self) -> Result<(), DbError> {
        self.batch("COMMIT")
    }

    fn rollback(&self) -> Result<(), DbError> {
        if self.conn.is_autocommit() {
            // SQLite already rolled back on error
            return Ok(());
        }
        self.batch("ROLLBACK")
    }

    fn try_advisory_lock(&self, _key: i64) -> Result<bool, DbError> {
        Err(DbError::Other("SQLite has no advisory locks".to_string()))
    }

    fn advisory_unlock(&self, _key: i64) -> Result<(), DbError> {
        Err(DbError::Other("SQLite has no advisory locks".to_string()))
    }

    fn table_exists(&self, schema: &str, table: &str) -> Result<bool, DbError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            Dialect::Sqlite.quote_identifier(schema)
        );
        let rows = self.query(&sql, &[SqlValue::text(table)])?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
            > 0)
    }

    fn current_user(&self) -> Result<Option<String>, DbError> {
        Ok(None)
    }

    fn is_lock_contention(&self, err: &DbError) -> bool {
        matches!(
            err,
            DbError::SqliteError(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
        )
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(v) => v.map_or(Value::Null, |v| Value::Integer(i64::from(v))),
        SqlValue::BigInt(v) => v.map_or(Value::Null, Value::Integer),
        SqlValue::Text(v) => v.clone().map_or(Value::Null, Value::Text),
        SqlValue::Bool(v) => v.map_or(Value::Null, |v| Value::Integer(i64::from(v))),
        SqlValue::Timestamp(v) => v.map_or(Value::Null, |ts| {
            Value::Text(ts.format(TIMESTAMP_FORMAT).to_string())
        }),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::BigInt(Some(i)),
        ValueRef::Real(f) => SqlValue::Text(Some(f.to_string())),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn current_schema_is_main() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert_eq!(backend.current_schema().unwrap().as_deref(), Some("main"));
        assert!(backend.set_current_schema("main").is_ok());
        assert!(backend.set_current_schema("other").is_err());
        assert!(backend.create_schema("other").is_err());
    }

    #[test]
    fn schema_exists_sees_attached_databases() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(backend.schema_exists("main").unwrap());
        assert!(!backend.schema_exists("aux").unwrap());
        backend.execute_script_statement("ATTACH DATABASE ':memory:' AS aux").unwrap();
        assert!(backend.schema_exists("aux").unwrap());
    }

    #[test]
    fn params_and_rows_round_trip_through_sql_values() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .execute_script_statement("CREATE TABLE t (i INTEGER, s TEXT, b INTEGER, ts TEXT)")
            .unwrap();
        let ts = NaiveDateTime::parse_from_str("2024-01-02 03:04:05", "%Y-%m-%d %H:%M:%S").unwrap();
        let inserted = backend
            .execute(
                "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Int(Some(7)),
                    SqlValue::Text(None),
                    SqlValue::Bool(Some(true)),
                    SqlValue::Timestamp(Some(ts)),
                ],
            )
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = backend.query("SELECT i, s, b, ts FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_i32(), Some(7));
        assert!(rows[0][1].is_null());
        assert_eq!(rows[0][2].as_bool(), Some(true));
        assert_eq!(rows[0][3].as_timestamp(), Some(ts));
    }

    #[test]
    fn table_exists_checks_sqlite_master() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(!backend.table_exists("main", "t").unwrap());
        backend.execute_script_statement("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(backend.table_exists("main", "t").unwrap());
    }

    #[test]
    fn rollback_discards_ddl() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.begin().unwrap();
        backend.execute_script_statement("CREATE TABLE t (id INTEGER)").unwrap();
        backend.rollback().unwrap();
        assert!(!backend.table_exists("main", "t").unwrap());
    }

    #[test]
    fn busy_errors_count_as_lock_contention() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let busy = DbError::SqliteError(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(backend.is_lock_contention(&busy));
        assert!(!backend.is_lock_contention(&DbError::Other("x".into())));
    }

    #[test]
    fn advisory_locks_are_unsupported() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(!backend.capabilities().advisory_locks);
        assert!(backend.try_advisory_lock(1).is_err());
    }
}

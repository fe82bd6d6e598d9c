//! Database backends
//!
//! The migration engine talks to the database only through [`Backend`]: a single
//! session that can report and switch its current schema, run statements, manage a
//! transaction and (where the engine supports it) take an advisory lock.
//!
//! What differs between engines is declared up front in [`Capabilities`] rather than
//! discovered by trial and error, because the history store and the executor commit
//! differently depending on it:
//!
//! | Backend    | transactional DDL | advisory locks | schema switching |
//! |------------|-------------------|----------------|------------------|
//! | PostgreSQL | yes               | yes            | yes              |
//! | SQLite     | yes               | no             | no (`main` only) |

pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use postgres::PostgresBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use crate::executor::DbError;
use chrono::NaiveDateTime;
use std::fmt;

/// SQL dialect of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "PostgreSQL",
            Dialect::Sqlite => "SQLite",
        }
    }

    /// Positional parameter marker, 1-based
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => format!("?{n}"),
        }
    }

    /// Quote an identifier, doubling embedded quotes
    pub fn quote_identifier(self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// `"schema"."object"`
    pub fn qualify(self, schema: &str, object: &str) -> String {
        format!("{}.{}", self.quote_identifier(schema), self.quote_identifier(object))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-backend behaviour the engine must honour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// DDL participates in transactions and is undone by `ROLLBACK`
    pub transactional_ddl: bool,
    /// Session-level advisory locks are available
    pub advisory_locks: bool,
    /// The session's current schema can be changed
    pub schema_switching: bool,
}

/// Driver-neutral value used for parameters and result columns
///
/// Parameters carry their type even when `None`, so a NULL still binds against a
/// typed PostgreSQL parameter. `Null` only appears in results whose column type is
/// unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(Option<i32>),
    BigInt(Option<i64>),
    Text(Option<String>),
    Bool(Option<bool>),
    Timestamp(Option<NaiveDateTime>),
}

/// One result row, columns in select order
pub type SqlRow = Vec<SqlValue>;

/// Text form used for timestamps on backends without a native timestamp type
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(Some(value.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            SqlValue::Null
                | SqlValue::Int(None)
                | SqlValue::BigInt(None)
                | SqlValue::Text(None)
                | SqlValue::Bool(None)
                | SqlValue::Timestamp(None)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(Some(v)) => Some(i64::from(*v)),
            SqlValue::BigInt(Some(v)) => Some(*v),
            SqlValue::Bool(Some(v)) => Some(i64::from(*v)),
            SqlValue::Text(Some(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(Some(s)) => Some(s),
            _ => None,
        }
    }

    /// Booleans, or integers as stored by SQLite
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(Some(b)) => Some(*b),
            SqlValue::Int(Some(v)) => Some(*v != 0),
            SqlValue::BigInt(Some(v)) => Some(*v != 0),
            _ => None,
        }
    }

    /// Native timestamps, or text in one of the common SQL renderings
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(Some(ts)) => Some(*ts),
            SqlValue::Text(Some(s)) => parse_timestamp(s),
            _ => None,
        }
    }
}

/// Parse the timestamp renderings PostgreSQL and SQLite produce
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        TIMESTAMP_FORMAT,
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Session-level schema operations
///
/// Split from [`Backend`] because schema resolution needs nothing else.
pub trait SchemaAccess {
    /// The schema unqualified names resolve against, `None` if the session has none
    fn current_schema(&self) -> Result<Option<String>, DbError>;

    /// Make `schema` the session's current schema
    fn set_current_schema(&self, schema: &str) -> Result<(), DbError>;

    fn schema_exists(&self, schema: &str) -> Result<bool, DbError>;

    fn create_schema(&self, schema: &str) -> Result<(), DbError>;
}

/// A single database session the migration engine runs on
///
/// All calls must go to the same session: the current schema, the advisory lock and
/// the open transaction are session state.
pub trait Backend: SchemaAccess {
    fn dialect(&self) -> Dialect;

    fn capabilities(&self) -> Capabilities;

    /// Run a parameterised statement, returning rows affected
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Run a parameterised query, returning every row
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    /// Run one statement of a migration script
    fn execute_script_statement(&self, sql: &str) -> Result<(), DbError> {
        self.execute(sql, &[]).map(|_| ())
    }

    fn begin(&self) -> Result<(), DbError>;

    fn commit(&self) -> Result<(), DbError>;

    fn rollback(&self) -> Result<(), DbError>;

    /// Non-blocking attempt at a session advisory lock
    fn try_advisory_lock(&self, key: i64) -> Result<bool, DbError>;

    fn advisory_unlock(&self, key: i64) -> Result<(), DbError>;

    fn table_exists(&self, schema: &str, table: &str) -> Result<bool, DbError>;

    /// Database user of the session, recorded as `installed_by`
    fn current_user(&self) -> Result<Option<String>, DbError>;

    /// Whether `err` means another session holds a conflicting lock
    fn is_lock_contention(&self, _err: &DbError) -> bool {
        false
    }
}

//! Migration-specific error types

use crate::executor::DbError;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// The schema a run operates on could not be determined or switched to
    SchemaResolution(String),
    /// Two migrations share a version (or two repeatables share a description)
    ConflictingVersion {
        version: String,
        first: String,
        second: String,
    },
    /// A script name cannot be parsed into version and description
    MalformedDescriptor { path: String, reason: String },
    /// An applied versioned migration was modified afterwards
    ChecksumMismatch {
        version: String,
        description: String,
        applied: Option<i32>,
        resolved: Option<i32>,
    },
    /// Another run kept the lock past the timeout
    LockTimeout(String),
    /// A migration's statements failed; the run stopped there
    Execution {
        version: Option<String>,
        description: String,
        statement: String,
        cause: DbError,
        /// Migrations committed by this run before the failure
        applied_count: usize,
    },
    /// The history table holds a failed attempt that must be repaired first
    FailedMigration {
        version: Option<String>,
        description: String,
    },
    /// Missing, ignored or otherwise inconsistent migrations
    Validation(String),
    /// The run was cancelled at a statement boundary
    Cancelled { applied_count: usize },
    Io { path: String, source: std::io::Error },
    Config(String),
    Database(DbError),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::SchemaResolution(msg) => {
                write!(f, "Unable to resolve the current schema: {}", msg)
            }
            MigrationError::ConflictingVersion { version, first, second } => {
                write!(
                    f,
                    "Found more than one migration with version {}\n\
                     Offenders:\n\
                     -> {}\n\
                     -> {}",
                    version, first, second
                )
            }
            MigrationError::MalformedDescriptor { path, reason } => {
                write!(f, "Invalid migration name '{}': {}", path, reason)
            }
            MigrationError::ChecksumMismatch {
                version,
                description,
                applied,
                resolved,
            } => {
                write!(
                    f,
                    "Migration '{}' (version {}) has been modified after being applied.\n\
                     Applied checksum: {}\n\
                     Resolved checksum: {}\n\
                     Either revert the file or run `repair` to accept the change.",
                    description,
                    version,
                    fmt_checksum(*applied),
                    fmt_checksum(*resolved)
                )
            }
            MigrationError::LockTimeout(msg) => {
                write!(
                    f,
                    "Migration lock timeout: {}\n\
                     Another process may be running migrations. If this persists, check for:\n\
                     - Stuck migration process\n\
                     - Database connection issues\n\
                     - A leftover LOCK row (installed_rank = -1) in the history table",
                    msg
                )
            }
            MigrationError::Execution {
                version,
                description,
                statement,
                cause,
                applied_count,
            } => {
                write!(
                    f,
                    "Migration '{}' ({}) failed after {} migration(s) were applied: {}\n\
                     Statement:\n{}",
                    description,
                    version.as_deref().map_or("repeatable".to_string(), |v| format!("version {v}")),
                    applied_count,
                    cause,
                    statement.trim()
                )
            }
            MigrationError::FailedMigration { version, description } => {
                write!(
                    f,
                    "Detected failed migration '{}'{}.\n\
                     Fix the database by hand and run `repair` before migrating again.",
                    description,
                    version.as_deref().map_or(String::new(), |v| format!(" (version {v})"))
                )
            }
            MigrationError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            MigrationError::Cancelled { applied_count } => {
                write!(f, "Migration run cancelled after {} migration(s)", applied_count)
            }
            MigrationError::Io { path, source } => write!(f, "Unable to read '{}': {}", path, source),
            MigrationError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            MigrationError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

fn fmt_checksum(checksum: Option<i32>) -> String {
    checksum.map_or_else(|| "none".to_string(), |c| c.to_string())
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Execution { cause, .. } => Some(cause),
            MigrationError::Io { source, .. } => Some(source),
            MigrationError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(error: DbError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}

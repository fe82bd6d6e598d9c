//! # Tidemark
//!
//! Versioned SQL schema migrations for PostgreSQL (`may_postgres`) and SQLite.
//!
//! Migrations are plain `.sql` files. Tidemark records every applied migration in a
//! history table inside the target schema, verifies checksums before applying
//! anything new, and serializes concurrent runs with a database-side lock so that
//! every application instance can migrate on startup.
//!
//! See [`migration`] for the engine and [`backend`] for the database capabilities it
//! relies on.

pub mod backend;
pub mod config;
pub mod connection;
pub mod executor;
#[cfg(any(feature = "metrics", feature = "tracing"))]
pub mod metrics;
pub mod migration;

pub use backend::{Backend, Capabilities, Dialect, PostgresBackend, SchemaAccess, SqlValue};
#[cfg(feature = "sqlite")]
pub use backend::SqliteBackend;
pub use config::{DatabaseConfig, MigrateConfig, TidemarkConfig};
pub use connection::{connect, validate_connection_string, ConnectionError};
pub use executor::{DbError, PostgresExecutor, SqlExecutor};
pub use migration::{
    startup_migrations, CancellationToken, MigrateResult, MigrationError, MigrationState, MigrationStatus,
    Migrator, RepairReport,
};

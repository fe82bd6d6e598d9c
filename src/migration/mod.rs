//! Migration system for Tidemark
//!
//! SQL migrations are discovered from filesystem locations, compared with the
//! schema history table and applied in version order, one run at a time:
//!
//! - versioned migrations (`V1_2__add_users.sql`) run once, in version order
//! - repeatable migrations (`R__views.sql`) run after them whenever their
//!   checksum changes
//!
//! # Example
//!
//! ```rust,no_run
//! use tidemark::{MigrateConfig, Migrator, SqliteBackend};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = SqliteBackend::open("app.db")?;
//!     let migrator = Migrator::new(MigrateConfig::new().with_locations(["filesystem:migrations"]))?;
//!
//!     let result = migrator.migrate(&backend)?;
//!     println!("applied {} migration(s)", result.applied_count);
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod cancel;
pub mod checksum;
pub mod error;
pub mod file;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod schema;
pub mod sql;
pub mod startup;
pub mod state_table;
pub mod status;
pub mod version;

pub use apply::{AppliedMigration, MigrationExecutor};
pub use cancel::CancellationToken;
pub use checksum::calculate_checksum;
pub use error::MigrationError;
pub use file::{MigrationCatalog, MigrationDescriptor, MigrationKind, NamingConvention};
pub use lock::{is_migration_lock_held, LockStrategy, MigrationLockGuard};
pub use migrator::{MigrateResult, Migrator, MigratorState, RepairReport};
pub use record::{AppliedRecord, RecordType};
pub use schema::{SchemaContext, SchemaTarget};
pub use startup::{startup_migrations, startup_migrations_with_timeout};
pub use state_table::HistoryTable;
pub use status::{MigrationInfo, MigrationState, MigrationStatus};
pub use version::MigrationVersion;

//! Current-schema resolution
//!
//! Decides which schema hosts the history table and leaves the session pointing at
//! it before anything else runs:
//!
//! - with configured schemas, the first one wins. The session is switched to it
//!   explicitly, whatever default the connection itself carries.
//! - without configured schemas, nothing is switched and the session's own current
//!   schema is asked for. There is no built-in fallback name: a session that
//!   resolves to no schema is a [`MigrationError::SchemaResolution`].

use crate::backend::SchemaAccess;
use crate::migration::MigrationError;
use serde::Serialize;

/// Schemas a run operates on, computed once per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaTarget {
    /// Schemas from configuration, in order (possibly empty)
    pub configured: Vec<String>,
    /// What the session resolved to before any switch
    pub connection_default: Option<String>,
    /// Schema hosting the history table
    pub history_schema: String,
    /// Configured schemas that do not exist yet
    pub missing: Vec<String>,
}

impl SchemaTarget {
    /// Whether the history schema itself still has to be created
    pub fn history_schema_missing(&self) -> bool {
        self.missing.iter().any(|s| *s == self.history_schema)
    }
}

pub struct SchemaContext;

impl SchemaContext {
    /// Resolve the run's schemas and switch the session to the history schema
    ///
    /// When `create_missing` is false, a configured schema that does not exist is an
    /// error instead of being reported in [`SchemaTarget::missing`].
    pub fn resolve<S: SchemaAccess + ?Sized>(
        access: &S,
        configured: &[String],
        create_missing: bool,
    ) -> Result<SchemaTarget, MigrationError> {
        let connection_default = access.current_schema().map_err(|e| {
            MigrationError::SchemaResolution(format!("could not query the connection's current schema: {e}"))
        })?;

        let Some(first) = configured.first() else {
            let history_schema = connection_default.clone().ok_or_else(|| {
                MigrationError::SchemaResolution(
                    "no schemas are configured and the connection has no current schema \
                     (its search path names no existing schema); configure `schemas` or fix \
                     the connection's default schema"
                        .to_string(),
                )
            })?;
            log::debug!("No schemas configured, using connection schema '{}'", history_schema);
            return Ok(SchemaTarget {
                configured: Vec::new(),
                connection_default,
                history_schema,
                missing: Vec::new(),
            });
        };

        let mut missing = Vec::new();
        for schema in configured {
            let exists = access.schema_exists(schema).map_err(|e| {
                MigrationError::SchemaResolution(format!("could not check whether schema '{schema}' exists: {e}"))
            })?;
            if !exists {
                if !create_missing {
                    return Err(MigrationError::SchemaResolution(format!(
                        "schema '{schema}' does not exist and schema creation is disabled"
                    )));
                }
                missing.push(schema.clone());
            }
        }

        if connection_default.as_deref() != Some(first.as_str()) {
            log::debug!(
                "Switching current schema from {:?} to configured schema '{}'",
                connection_default,
                first
            );
        }
        access.set_current_schema(first).map_err(|e| {
            MigrationError::SchemaResolution(format!("could not switch the current schema to '{first}': {e}"))
        })?;

        Ok(SchemaTarget {
            configured: configured.to_vec(),
            connection_default,
            history_schema: first.clone(),
            missing,
        })
    }
}

//! `AppliedRecord` - Represents rows of the schema history table

use crate::backend::SqlRow;
use crate::migration::file::MigrationKind;
use crate::migration::version::MigrationVersion;
use crate::migration::MigrationError;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Value of the history table's `type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Versioned,
    Repeatable,
    /// Synthetic row marking the baseline version
    Baseline,
    /// Marker row written when the engine created the configured schemas
    Schema,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Versioned => "VERSIONED",
            RecordType::Repeatable => "REPEATABLE",
            RecordType::Baseline => "BASELINE",
            RecordType::Schema => "SCHEMA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VERSIONED" => Some(RecordType::Versioned),
            "REPEATABLE" => Some(RecordType::Repeatable),
            "BASELINE" => Some(RecordType::Baseline),
            "SCHEMA" => Some(RecordType::Schema),
            _ => None,
        }
    }
}

impl From<MigrationKind> for RecordType {
    fn from(kind: MigrationKind) -> Self {
        match kind {
            MigrationKind::Versioned => RecordType::Versioned,
            MigrationKind::Repeatable => RecordType::Repeatable,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the schema history table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    pub installed_rank: i32,
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: RecordType,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_by: String,
    pub installed_on: NaiveDateTime,
    pub execution_time_ms: i32,
    pub success: bool,
}

impl AppliedRecord {
    /// Create an `AppliedRecord` from a history table row
    ///
    /// Expected column order: `installed_rank`, `version`, `description`, `type`,
    /// `script`, `checksum`, `installed_by`, `installed_on`, `execution_time`, `success`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Validation` when a column holds a value the engine
    /// does not understand (corrupt or foreign history table).
    pub fn from_row(row: &SqlRow) -> Result<Self, MigrationError> {
        if row.len() < 10 {
            return Err(corrupt(format!("expected 10 columns, got {}", row.len())));
        }

        let installed_rank = row[0]
            .as_i32()
            .ok_or_else(|| corrupt("installed_rank is NULL"))?;

        let version = match row[1].as_str() {
            Some(v) if !v.is_empty() => Some(
                MigrationVersion::parse(v)
                    .map_err(|e| corrupt(format!("rank {installed_rank}: {e}")))?,
            ),
            _ => None,
        };

        let kind_str = row[3].as_str().unwrap_or_default();
        let kind = RecordType::parse(kind_str)
            .ok_or_else(|| corrupt(format!("rank {installed_rank}: unknown type '{kind_str}'")))?;

        let installed_on = row[7].as_timestamp().ok_or_else(|| {
            corrupt(format!("rank {installed_rank}: unreadable installed_on {:?}", row[7]))
        })?;

        Ok(Self {
            installed_rank,
            version,
            description: row[2].as_str().unwrap_or_default().to_string(),
            kind,
            script: row[4].as_str().unwrap_or_default().to_string(),
            checksum: row[5].as_i32(),
            installed_by: row[6].as_str().unwrap_or_default().to_string(),
            installed_on,
            execution_time_ms: row[8].as_i32().unwrap_or(0),
            success: row[9].as_bool().unwrap_or(false),
        })
    }

    pub fn is_versioned(&self) -> bool {
        self.kind == RecordType::Versioned
    }

    pub fn is_repeatable(&self) -> bool {
        self.kind == RecordType::Repeatable
    }

    pub fn is_baseline(&self) -> bool {
        self.kind == RecordType::Baseline
    }
}

fn corrupt(msg: impl Into<String>) -> MigrationError {
    MigrationError::Validation(format!("unreadable schema history row: {}", msg.into()))
}

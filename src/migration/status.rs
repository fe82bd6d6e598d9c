//! Migration planning and status reporting
//!
//! [`plan`] diffs the resolved migrations against the history table and decides what
//! a run applies; [`MigrationStatus::build`] turns the same inputs into the
//! per-migration report behind `info`.

use crate::migration::checksum::checksums_match;
use crate::migration::file::{sort_for_application, MigrationDescriptor};
use crate::migration::record::{AppliedRecord, RecordType};
use crate::migration::version::MigrationVersion;
use crate::migration::MigrationError;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Rules that shape the pending set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Apply versioned migrations older than the latest applied one
    pub out_of_order: bool,
    /// Fail on missing and ignored migrations
    pub validate: bool,
    pub ignore_missing_migrations: bool,
}

/// Outcome of planning: what to apply, in order
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub pending: Vec<MigrationDescriptor>,
    /// Versioned migrations skipped because they are below the latest applied version
    pub ignored: Vec<MigrationDescriptor>,
    /// Highest applied version, including a baseline
    pub current_version: Option<MigrationVersion>,
}

/// Highest version recorded by a baseline row
pub fn baseline_version(applied: &[AppliedRecord]) -> Option<MigrationVersion> {
    applied
        .iter()
        .filter(|r| r.success && r.is_baseline())
        .filter_map(|r| r.version.clone())
        .max()
}

/// Highest successfully applied version, baseline included
pub fn current_version(applied: &[AppliedRecord]) -> Option<MigrationVersion> {
    applied
        .iter()
        .filter(|r| r.success && (r.is_versioned() || r.is_baseline()))
        .filter_map(|r| r.version.clone())
        .max()
}

/// First failed row, if any
pub fn first_failed(applied: &[AppliedRecord]) -> Option<&AppliedRecord> {
    applied.iter().find(|r| !r.success)
}

/// Latest successful row per repeatable description
fn latest_repeatables(applied: &[AppliedRecord]) -> HashMap<&str, &AppliedRecord> {
    let mut latest: HashMap<&str, &AppliedRecord> = HashMap::new();
    for record in applied.iter().filter(|r| r.success && r.is_repeatable()) {
        // `applied` is ordered by rank, so later rows overwrite earlier ones
        latest.insert(record.description.as_str(), record);
    }
    latest
}

/// Fail if any applied versioned migration no longer matches its script
pub fn verify_checksums(
    resolved: &[MigrationDescriptor],
    applied: &[AppliedRecord],
) -> Result<(), MigrationError> {
    let resolved_by_version: HashMap<&MigrationVersion, &MigrationDescriptor> = resolved
        .iter()
        .filter_map(|m| m.version.as_ref().map(|v| (v, m)))
        .collect();

    for record in applied.iter().filter(|r| r.success && r.is_versioned()) {
        let Some(version) = &record.version else { continue };
        if let Some(migration) = resolved_by_version.get(version) {
            if !checksums_match(record.checksum, Some(migration.checksum)) {
                return Err(MigrationError::ChecksumMismatch {
                    version: version.to_string(),
                    description: record.description.clone(),
                    applied: record.checksum,
                    resolved: Some(migration.checksum),
                });
            }
        }
    }
    Ok(())
}

/// Compute the pending set
///
/// - versioned migrations are pending when no row has their version; those at or
///   below a baseline are skipped, those below the latest applied version are
///   pending only with `out_of_order`
/// - repeatables are pending when never applied or when their checksum changed
/// - a changed versioned migration is a [`MigrationError::ChecksumMismatch`]
///
/// Failed rows are not checked here; the migrator refuses to plan while one exists.
pub fn plan(
    resolved: &[MigrationDescriptor],
    applied: &[AppliedRecord],
    options: PlanOptions,
) -> Result<MigrationPlan, MigrationError> {
    verify_checksums(resolved, applied)?;

    let baseline = baseline_version(applied);
    let current = current_version(applied);
    let applied_versions: HashSet<&MigrationVersion> = applied
        .iter()
        .filter(|r| r.is_versioned() || r.is_baseline())
        .filter_map(|r| r.version.as_ref())
        .collect();
    let resolved_versions: HashSet<&MigrationVersion> =
        resolved.iter().filter_map(|m| m.version.as_ref()).collect();

    // Applied but no longer on disk
    let missing: Vec<&AppliedRecord> = applied
        .iter()
        .filter(|r| r.success && r.is_versioned())
        .filter(|r| r.version.as_ref().is_some_and(|v| !resolved_versions.contains(v)))
        .collect();
    if let Some(record) = missing.first() {
        let version = record.version.as_ref().map(ToString::to_string).unwrap_or_default();
        if options.validate && !options.ignore_missing_migrations {
            return Err(MigrationError::Validation(format!(
                "Detected applied migration not resolved locally: {} - {}. \
                 Restore the script or set ignore_missing_migrations",
                version, record.description
            )));
        }
        for record in &missing {
            log::warn!(
                "Applied migration {} - {} is not resolved locally",
                record.version.as_ref().map(ToString::to_string).unwrap_or_default(),
                record.description
            );
        }
    }

    let mut pending = Vec::new();
    let mut ignored = Vec::new();
    for migration in resolved.iter() {
        match &migration.version {
            Some(version) => {
                if applied_versions.contains(version) {
                    continue;
                }
                if baseline.as_ref().is_some_and(|b| version <= b) {
                    continue;
                }
                if current.as_ref().is_some_and(|c| version < c) && !options.out_of_order {
                    ignored.push(migration.clone());
                    continue;
                }
                pending.push(migration.clone());
            }
            None => pending.push(migration.clone()),
        }
    }

    let latest = latest_repeatables(applied);
    pending.retain(|m| {
        if !m.is_repeatable() {
            return true;
        }
        latest
            .get(m.description.as_str())
            .map_or(true, |record| !checksums_match(record.checksum, Some(m.checksum)))
    });

    if let Some(first) = ignored.first() {
        if options.validate {
            return Err(MigrationError::Validation(format!(
                "Detected resolved migration not applied to database: {}. \
                 It is older than the current version {}; set out_of_order to apply it",
                first,
                current.as_ref().map(ToString::to_string).unwrap_or_default()
            )));
        }
        for migration in &ignored {
            log::warn!("Ignoring out-of-order migration {}", migration);
        }
    }

    sort_for_application(&mut pending);
    Ok(MigrationPlan {
        pending,
        ignored,
        current_version: current,
    })
}

/// State of one migration in an `info` report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Pending,
    Success,
    Failed,
    Baseline,
    /// At or below the baseline version, never applied
    BelowBaseline,
    /// Repeatable whose script changed since it was applied
    Outdated,
    /// Earlier application of a repeatable that has been re-applied since
    Superseded,
    /// Applied, but no longer resolved
    Missing,
    /// Not applied and older than the current version
    Ignored,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Pending => "Pending",
            MigrationState::Success => "Success",
            MigrationState::Failed => "Failed",
            MigrationState::Baseline => "Baseline",
            MigrationState::BelowBaseline => "Below Baseline",
            MigrationState::Outdated => "Outdated",
            MigrationState::Superseded => "Superseded",
            MigrationState::Missing => "Missing",
            MigrationState::Ignored => "Ignored",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an `info` report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationInfo {
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: RecordType,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_rank: Option<i32>,
    pub installed_on: Option<NaiveDateTime>,
    pub installed_by: Option<String>,
    pub execution_time_ms: Option<i32>,
    pub state: MigrationState,
}

impl MigrationInfo {
    fn from_record(record: &AppliedRecord, state: MigrationState) -> Self {
        Self {
            version: record.version.clone(),
            description: record.description.clone(),
            kind: record.kind,
            script: record.script.clone(),
            checksum: record.checksum,
            installed_rank: Some(record.installed_rank),
            installed_on: Some(record.installed_on),
            installed_by: Some(record.installed_by.clone()),
            execution_time_ms: Some(record.execution_time_ms),
            state,
        }
    }

    fn from_descriptor(migration: &MigrationDescriptor, state: MigrationState) -> Self {
        Self {
            version: migration.version.clone(),
            description: migration.description.clone(),
            kind: migration.kind.into(),
            script: migration.script.clone(),
            checksum: Some(migration.checksum),
            installed_rank: None,
            installed_on: None,
            installed_by: None,
            execution_time_ms: None,
            state,
        }
    }
}

/// Migration status information
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Schema hosting the history table
    pub schema: String,
    /// Applied rows in rank order, then unapplied migrations in application order
    pub migrations: Vec<MigrationInfo>,
    pub current_version: Option<MigrationVersion>,
    pub applied_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
}

impl MigrationStatus {
    /// Build the report for resolved migrations against the history rows
    pub fn build(
        schema: impl Into<String>,
        resolved: &[MigrationDescriptor],
        applied: &[AppliedRecord],
        out_of_order: bool,
    ) -> Self {
        let baseline = baseline_version(applied);
        let current = current_version(applied);
        let latest = latest_repeatables(applied);
        let resolved_versions: HashMap<&MigrationVersion, &MigrationDescriptor> = resolved
            .iter()
            .filter_map(|m| m.version.as_ref().map(|v| (v, m)))
            .collect();
        let resolved_repeatables: HashMap<&str, &MigrationDescriptor> = resolved
            .iter()
            .filter(|m| m.is_repeatable())
            .map(|m| (m.description.as_str(), m))
            .collect();

        let mut migrations = Vec::new();
        for record in applied {
            let state = if !record.success {
                MigrationState::Failed
            } else {
                match record.kind {
                    RecordType::Baseline => MigrationState::Baseline,
                    RecordType::Schema => MigrationState::Success,
                    RecordType::Versioned => match &record.version {
                        Some(v) if resolved_versions.contains_key(v) => MigrationState::Success,
                        _ => MigrationState::Missing,
                    },
                    RecordType::Repeatable => {
                        let is_latest = latest
                            .get(record.description.as_str())
                            .is_some_and(|l| l.installed_rank == record.installed_rank);
                        match resolved_repeatables.get(record.description.as_str()) {
                            None => MigrationState::Missing,
                            Some(_) if !is_latest => MigrationState::Superseded,
                            Some(m) if !checksums_match(record.checksum, Some(m.checksum)) => {
                                MigrationState::Outdated
                            }
                            Some(_) => MigrationState::Success,
                        }
                    }
                }
            };
            migrations.push(MigrationInfo::from_record(record, state));
        }

        let applied_versions: HashSet<&MigrationVersion> = applied
            .iter()
            .filter(|r| r.is_versioned() || r.is_baseline())
            .filter_map(|r| r.version.as_ref())
            .collect();
        let mut unapplied: Vec<&MigrationDescriptor> = resolved
            .iter()
            .filter(|m| match &m.version {
                Some(v) => !applied_versions.contains(v),
                None => !latest.contains_key(m.description.as_str()),
            })
            .collect();
        unapplied.sort_by(|a, b| match (&a.version, &b.version) {
            (Some(va), Some(vb)) => va.cmp(vb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.description.cmp(&b.description),
        });
        for migration in unapplied {
            let state = match &migration.version {
                Some(v) if baseline.as_ref().is_some_and(|b| v <= b) => MigrationState::BelowBaseline,
                Some(v) if current.as_ref().is_some_and(|c| v < c) && !out_of_order => MigrationState::Ignored,
                _ => MigrationState::Pending,
            };
            migrations.push(MigrationInfo::from_descriptor(migration, state));
        }

        let count = |states: &[MigrationState]| migrations.iter().filter(|m| states.contains(&m.state)).count();
        let applied_count = count(&[MigrationState::Success, MigrationState::Outdated]);
        let pending_count = count(&[MigrationState::Pending, MigrationState::Outdated]);
        let failed_count = count(&[MigrationState::Failed]);

        Self {
            schema: schema.into(),
            migrations,
            current_version: current,
            applied_count,
            pending_count,
            failed_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0 && self.failed_count == 0
    }

    /// Get the latest applied migration version
    #[must_use]
    pub fn latest_applied_version(&self) -> Option<&MigrationVersion> {
        self.current_version.as_ref()
    }

    /// Get the next pending migration version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<&MigrationVersion> {
        self.migrations
            .iter()
            .find(|m| m.state == MigrationState::Pending && m.version.is_some())
            .and_then(|m| m.version.as_ref())
    }

    pub fn pending(&self) -> impl Iterator<Item = &MigrationInfo> {
        self.migrations
            .iter()
            .filter(|m| matches!(m.state, MigrationState::Pending | MigrationState::Outdated))
    }
}

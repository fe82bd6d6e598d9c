//! Migration file discovery and parsing
//!
//! Scripts are found by walking each configured location recursively in sorted path
//! order. File names follow the pattern:
//!
//! - versioned: `V<version>__<description>.sql`, e.g. `V1.2__add_users.sql`
//! - repeatable: `R__<description>.sql`, e.g. `R__refresh_views.sql`
//!
//! Prefixes, separator and suffix come from [`MigrateConfig`].

use crate::backend::Dialect;
use crate::config::MigrateConfig;
use crate::migration::checksum::{calculate_checksum, checksum_of};
use crate::migration::sql::SqlScript;
use crate::migration::state_table::{MAX_DESCRIPTION_LEN, MAX_VERSION_LEN};
use crate::migration::version::MigrationVersion;
use crate::migration::MigrationError;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Location scheme for directories on the local file system
pub const FILESYSTEM_PREFIX: &str = "filesystem:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationKind {
    Versioned,
    Repeatable,
}

impl MigrationKind {
    /// Value of the history table's `type` column
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Versioned => "VERSIONED",
            MigrationKind::Repeatable => "REPEATABLE",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered migration script
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    /// `None` for repeatable migrations
    pub version: Option<MigrationVersion>,
    pub description: String,
    /// Checksum of the normalized content at discovery time
    pub checksum: i32,
    /// Path relative to its location, `/`-separated
    pub script: String,
    pub path: PathBuf,
    pub kind: MigrationKind,
}

impl MigrationDescriptor {
    pub fn is_repeatable(&self) -> bool {
        self.kind == MigrationKind::Repeatable
    }

    /// Version as rendered in the history table
    pub fn version_string(&self) -> Option<String> {
        self.version.as_ref().map(ToString::to_string)
    }

    /// Read and split the script
    ///
    /// Fails if the file changed since discovery, because the recorded checksum
    /// would no longer describe what ran.
    pub fn load_script(&self, dialect: Dialect) -> Result<SqlScript, MigrationError> {
        let content = fs::read_to_string(&self.path).map_err(|e| MigrationError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        if checksum_of(&content) != self.checksum {
            return Err(MigrationError::Validation(format!(
                "{} changed on disk after it was scanned",
                self.script
            )));
        }
        Ok(SqlScript::parse(&content, dialect))
    }
}

impl fmt::Display for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} - {}", v, self.description),
            None => write!(f, "<< Repeatable >> {}", self.description),
        }
    }
}

/// File naming rules compiled to regular expressions
#[derive(Debug, Clone)]
pub struct NamingConvention {
    versioned: Regex,
    repeatable: Regex,
    suffix: String,
}

impl NamingConvention {
    pub fn new(prefix: &str, repeatable_prefix: &str, separator: &str, suffix: &str) -> Result<Self, MigrationError> {
        // Lazy version group: the version ends at the first separator
        let versioned = Regex::new(&format!(
            "^{}(.+?){}(.*){}$",
            regex::escape(prefix),
            regex::escape(separator),
            regex::escape(suffix)
        ))
        .map_err(|e| MigrationError::Config(format!("Invalid migration naming: {e}")))?;
        let repeatable = Regex::new(&format!(
            "^{}{}(.+){}$",
            regex::escape(repeatable_prefix),
            regex::escape(separator),
            regex::escape(suffix)
        ))
        .map_err(|e| MigrationError::Config(format!("Invalid migration naming: {e}")))?;

        Ok(Self {
            versioned,
            repeatable,
            suffix: suffix.to_string(),
        })
    }

    pub fn from_config(config: &MigrateConfig) -> Result<Self, MigrationError> {
        Self::new(
            &config.sql_migration_prefix,
            &config.repeatable_sql_migration_prefix,
            &config.sql_migration_separator,
            &config.sql_migration_suffix,
        )
    }

    /// Whether the catalog should look at the file at all
    pub fn is_candidate(&self, file_name: &str) -> bool {
        file_name.ends_with(&self.suffix)
    }

    /// Parse a file name into kind, version and description
    ///
    /// # Example
    /// - `V1_2__add_users.sql` → versioned, version 1.2, "add users"
    /// - `R__refresh_views.sql` → repeatable, "refresh views"
    pub fn parse_filename(
        &self,
        file_name: &str,
    ) -> Result<(MigrationKind, Option<MigrationVersion>, String), String> {
        if let Some(caps) = self.repeatable.captures(file_name) {
            let description = describe(caps.get(1).map_or("", |m| m.as_str()));
            if description.is_empty() {
                return Err("repeatable migrations need a description".to_string());
            }
            check_len("description", &description, MAX_DESCRIPTION_LEN)?;
            return Ok((MigrationKind::Repeatable, None, description));
        }
        if let Some(caps) = self.versioned.captures(file_name) {
            let version = MigrationVersion::parse(caps.get(1).map_or("", |m| m.as_str()))?;
            let description = describe(caps.get(2).map_or("", |m| m.as_str()));
            check_len("version", &version.to_string(), MAX_VERSION_LEN)?;
            check_len("description", &description, MAX_DESCRIPTION_LEN)?;
            return Ok((MigrationKind::Versioned, Some(version), description));
        }
        Err("expected V<version>__<description> or R__<description>".to_string())
    }
}

/// History columns are fixed width, and a stored value must match what is discovered
fn check_len(what: &str, value: &str, max: usize) -> Result<(), String> {
    let len = value.chars().count();
    if len > max {
        return Err(format!("{what} is {len} characters long, at most {max} are allowed"));
    }
    Ok(())
}

fn describe(raw: &str) -> String {
    raw.replace('_', " ").trim().to_string()
}

/// Strip the `filesystem:` scheme, rejecting schemes that are not supported
pub fn location_path(location: &str) -> Result<PathBuf, MigrationError> {
    if let Some(path) = location.strip_prefix(FILESYSTEM_PREFIX) {
        return Ok(PathBuf::from(path));
    }
    match location.split_once(':') {
        // Windows drive letters look like a scheme
        Some((scheme, _)) if scheme.len() > 1 => Err(MigrationError::Config(format!(
            "Unsupported location '{location}': only {FILESYSTEM_PREFIX} locations are supported"
        ))),
        _ => Ok(PathBuf::from(location)),
    }
}

/// Discovers migrations in a set of locations
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    locations: Vec<PathBuf>,
    naming: NamingConvention,
}

impl MigrationCatalog {
    pub fn new(locations: Vec<PathBuf>, naming: NamingConvention) -> Self {
        Self { locations, naming }
    }

    pub fn from_config(config: &MigrateConfig) -> Result<Self, MigrationError> {
        let locations = config
            .locations
            .iter()
            .map(|l| location_path(l))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(locations, NamingConvention::from_config(config)?))
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Lazily walk every location, yielding descriptors as files are found
    ///
    /// The same file reached through overlapping locations is yielded once; a
    /// second file with an already seen version (or repeatable description) yields
    /// `MigrationError::ConflictingVersion`.
    pub fn scan(&self) -> CatalogScan<'_> {
        CatalogScan {
            catalog: self,
            next_location: 0,
            root: PathBuf::new(),
            stack: Vec::new(),
            seen_files: HashSet::new(),
            versions: HashMap::new(),
            repeatables: HashMap::new(),
        }
    }

    /// Scan everything and return migrations in application order: versioned by
    /// version, then repeatables by description
    pub fn resolve(&self) -> Result<Vec<MigrationDescriptor>, MigrationError> {
        let mut migrations = self.scan().collect::<Result<Vec<_>, _>>()?;
        sort_for_application(&mut migrations);
        Ok(migrations)
    }
}

/// Versioned migrations by version, then repeatables by description
pub fn sort_for_application(migrations: &mut [MigrationDescriptor]) {
    migrations.sort_by(|a, b| match (&a.version, &b.version) {
        (Some(va), Some(vb)) => va.cmp(vb),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.description.cmp(&b.description),
    });
}

/// Iterator returned by [`MigrationCatalog::scan`]
pub struct CatalogScan<'a> {
    catalog: &'a MigrationCatalog,
    next_location: usize,
    root: PathBuf,
    /// Pending paths, last entry visited first
    stack: Vec<PathBuf>,
    seen_files: HashSet<PathBuf>,
    versions: HashMap<MigrationVersion, String>,
    repeatables: HashMap<String, String>,
}

impl CatalogScan<'_> {
    /// Move on to the next location; `false` when all are done
    fn advance_location(&mut self) -> bool {
        while let Some(location) = self.catalog.locations.get(self.next_location) {
            self.next_location += 1;
            if !location.is_dir() {
                log::warn!("Migration location {} does not exist, skipping", location.display());
                continue;
            }
            self.root = location.clone();
            self.stack.push(location.clone());
            return true;
        }
        false
    }

    fn push_children(&mut self, dir: &Path) -> Result<(), MigrationError> {
        let io_err = |e| MigrationError::Io {
            path: dir.display().to_string(),
            source: e,
        };
        let mut children = fs::read_dir(dir)
            .map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        children.sort();
        self.stack.extend(children.into_iter().rev());
        Ok(())
    }

    fn describe_file(&mut self, path: PathBuf) -> Option<Result<MigrationDescriptor, MigrationError>> {
        let file_name = path.file_name()?.to_str()?.to_string();
        if !self.catalog.naming.is_candidate(&file_name) {
            log::debug!("Ignoring non-migration file {}", path.display());
            return None;
        }

        let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if !self.seen_files.insert(canonical) {
            return None;
        }

        let script = path
            .strip_prefix(&self.root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let (kind, version, description) = match self.catalog.naming.parse_filename(&file_name) {
            Ok(parsed) => parsed,
            Err(reason) => {
                return Some(Err(MigrationError::MalformedDescriptor {
                    path: path.display().to_string(),
                    reason,
                }))
            }
        };

        let previous = match &version {
            Some(v) => self.versions.insert(v.clone(), script.clone()),
            None => self.repeatables.insert(description.clone(), script.clone()),
        };
        if let Some(first) = previous {
            return Some(Err(MigrationError::ConflictingVersion {
                version: version.map_or_else(|| format!("<< Repeatable >> {description}"), |v| v.to_string()),
                first,
                second: script,
            }));
        }

        let checksum = match calculate_checksum(&path) {
            Ok(checksum) => checksum,
            Err(e) => return Some(Err(e)),
        };

        Some(Ok(MigrationDescriptor {
            version,
            description,
            checksum,
            script,
            path,
            kind,
        }))
    }
}

impl Iterator for CatalogScan<'_> {
    type Item = Result<MigrationDescriptor, MigrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = match self.stack.pop() {
                Some(path) => path,
                None if self.advance_location() => continue,
                None => return None,
            };

            if path.is_dir() {
                if let Err(e) = self.push_children(&path) {
                    return Some(Err(e));
                }
                continue;
            }

            if let Some(item) = self.describe_file(path) {
                return Some(item);
            }
        }
    }
}

//! Checksum calculation for migration scripts

use crate::migration::MigrationError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Calculate the checksum of a migration file
///
/// The content is normalized before hashing so that line-ending conversions by
/// version control do not count as modifications:
/// - a leading UTF-8 BOM is dropped
/// - lines are split on `\n` or `\r\n` and each is hashed followed by `\n`
///
/// The first four bytes of the SHA-256 digest, big-endian, give the stored `i32`.
///
/// # Errors
///
/// Returns `MigrationError::Io` if the file cannot be read
pub fn calculate_checksum(migration_file_path: &Path) -> Result<i32, MigrationError> {
    let content = fs::read_to_string(migration_file_path).map_err(|e| MigrationError::Io {
        path: migration_file_path.display().to_string(),
        source: e,
    })?;

    Ok(checksum_of(&content))
}

/// Checksum of script content already in memory
pub fn checksum_of(content: &str) -> i32 {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut hasher = Sha256::new();
    for line in content.lines() {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();

    i32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Whether an applied checksum still matches the resolved one
///
/// Rows written without a checksum (baseline, schema markers) never match a script.
pub fn checksums_match(applied: Option<i32>, resolved: Option<i32>) -> bool {
    applied == resolved
}

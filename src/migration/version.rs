//! Migration versions
//!
//! A version is one or more numeric components separated by `.` or `_`. Versions
//! compare component by component as numbers; when one is a prefix of the other the
//! shorter sorts first, so `1.2 < 1.2.1 < 1.3`. Leading zeros carry no meaning
//! (`1.01` equals `1.1`).

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct MigrationVersion {
    parts: Vec<u64>,
    raw: String,
}

impl MigrationVersion {
    /// Parse a version token, e.g. `1`, `1.2.1`, `2024_01_15`
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("version is empty".to_string());
        }
        let parts = raw
            .split(['.', '_'])
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("'{raw}' is not a valid version"));
                }
                part.parse::<u64>()
                    .map_err(|_| format!("version component '{part}' is too large"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            parts,
            raw: raw.to_string(),
        })
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// The token as written in the file name
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for MigrationVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MigrationVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec<u64> ordering is lexicographic with the shorter prefix first
        self.parts.cmp(&other.parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn dotted_versions_order_component_wise() {
        let mut versions = vec![v("1.2.1"), v("1.1"), v("1.2")];
        versions.sort();
        let ordered: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(ordered, vec!["1.1", "1.2", "1.2.1"]);
    }

    #[test]
    fn components_compare_numerically() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("10") > v("9"));
        assert!(v("1.2") < v("1.3"));
    }

    #[test]
    fn leading_zeros_are_insignificant() {
        assert_eq!(v("1.01"), v("1.1"));
        assert_eq!(v("001"), v("1"));
        assert_eq!(v("1.01").raw(), "1.01");
        assert_eq!(v("1.01").to_string(), "1.1");
    }

    #[test]
    fn underscore_separates_components() {
        assert_eq!(v("1_2"), v("1.2"));
        assert_eq!(v("2024_01_15").parts(), &[2024, 1, 15]);
    }

    #[test]
    fn trailing_zero_component_is_a_distinct_later_version() {
        assert!(v("1") < v("1.0"));
        assert_ne!(v("1"), v("1.0"));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["", "1..2", "1.", "a", "1.b", "1-2", " 1"] {
            assert!(MigrationVersion::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}

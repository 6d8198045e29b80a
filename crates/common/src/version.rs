//! Semantic version parsing and compatibility checks for node and
//! gateway software versions.
//!
//! Valid version strings look like `0.1.0` or `1.3.0-ff81cdae`: major and
//! minor must be numeric, the patch component may be anything but must be
//! present.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("version string must contain major, minor and patch separated by '.'")]
    MissingComponents,

    #[error("major version '{0}' is not an integer")]
    BadMajor(String),

    #[error("minor version '{0}' is not an integer")]
    BadMinor(String),
}

/// A parsed `major.minor.patch` version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: String,
}

impl Version {
    /// Compatibility rule: the candidate's major version must equal the
    /// required major, and its minor version must be at least the required
    /// minor. Patch versions never affect compatibility.
    pub fn is_compatible(required: &Version, candidate: &Version) -> bool {
        candidate.major == required.major && candidate.minor >= required.minor
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[2].is_empty() {
            return Err(VersionError::MissingComponents);
        }
        let major = parts[0]
            .parse::<u64>()
            .map_err(|_| VersionError::BadMajor(parts[0].to_string()))?;
        let minor = parts[1]
            .parse::<u64>()
            .map_err(|_| VersionError::BadMinor(parts[1].to_string()))?;
        Ok(Version {
            major,
            minor,
            patch: parts[2].to_string(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().expect("parse version")
    }

    #[test]
    fn test_parse_plain() {
        let version = v("1.3.0");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 3);
        assert_eq!(version.patch, "0");
    }

    #[test]
    fn test_parse_patch_with_suffix() {
        let version = v("1.3.0-ff81cdae");
        assert_eq!(version.patch, "0-ff81cdae");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1.3".parse::<Version>().is_err());
        assert!("a.3.0".parse::<Version>().is_err());
        assert!("1.b.0".parse::<Version>().is_err());
        assert!("1.2.".parse::<Version>().is_err());
    }

    #[test]
    fn test_compatibility() {
        let required = v("1.2.0");
        assert!(Version::is_compatible(&required, &v("1.2.0")));
        assert!(Version::is_compatible(&required, &v("1.5.7-beta")));
        assert!(!Version::is_compatible(&required, &v("1.1.9")));
        assert!(!Version::is_compatible(&required, &v("2.2.0")));
        assert!(!Version::is_compatible(&required, &v("0.2.0")));
    }

    #[test]
    fn test_display_roundtrip() {
        let version = v("2.10.3-rc1");
        assert_eq!(version.to_string(), "2.10.3-rc1");
    }
}

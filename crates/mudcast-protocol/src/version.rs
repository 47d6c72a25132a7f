//! Protocol versioning.

use serde::{Deserialize, Serialize};

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version carried in `Login` and `Welcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Incremented on breaking frame changes.
    pub major: u8,
    /// Incremented when frames or fields are added.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions sharing a major number can talk to each other.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let older_minor = Version::new(1, 0);
        let newer_minor = Version::new(1, 3);
        let next_major = Version::new(2, 0);

        assert!(older_minor.is_compatible_with(&newer_minor));
        assert!(newer_minor.is_compatible_with(&older_minor));
        assert!(!older_minor.is_compatible_with(&next_major));
        assert!(older_minor < newer_minor);
    }

    #[test]
    fn test_version_display_and_default() {
        assert_eq!(Version::new(1, 2).to_string(), "1.2");
        assert_eq!(Version::default(), PROTOCOL_VERSION);
    }
}

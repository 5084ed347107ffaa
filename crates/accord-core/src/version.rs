//! Four-component capability versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version used to rank alternative implementations of one capability.
///
/// Ordering is lexicographic over `major.minor.build.revision`. The
/// version never gates wire compatibility, it only decides which
/// alternative wins when several match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl CapabilityVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Shorthand for `major.minor.0.0`.
    pub const fn of(major: u32, minor: u32) -> Self {
        Self::new(major, minor, 0, 0)
    }
}

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Accepts two to four dot-separated components; missing ones are zero.
impl FromStr for CapabilityVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(VersionParseError::ComponentCount(s.to_string()));
        }

        let mut components = [0u32; 4];
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| VersionParseError::InvalidComponent(part.to_string()))?;
        }

        let [major, minor, build, revision] = components;
        Ok(Self::new(major, minor, build, revision))
    }
}

impl TryFrom<String> for CapabilityVersion {
    type Error = VersionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CapabilityVersion> for String {
    fn from(v: CapabilityVersion) -> Self {
        v.to_string()
    }
}

/// Error parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("version must have 2 to 4 components, got: {0}")]
    ComponentCount(String),
    #[error("invalid version component: {0}")]
    InvalidComponent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_short_and_full() {
        assert_eq!("1.0".parse(), Ok(CapabilityVersion::of(1, 0)));
        assert_eq!("2.1.3.4".parse(), Ok(CapabilityVersion::new(2, 1, 3, 4)));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "1".parse::<CapabilityVersion>(),
            Err(VersionParseError::ComponentCount(_))
        ));
        assert!(matches!(
            "1.x".parse::<CapabilityVersion>(),
            Err(VersionParseError::InvalidComponent(c)) if c == "x"
        ));
    }

    #[test]
    fn ordering_is_componentwise() {
        assert!(CapabilityVersion::of(1, 9) < CapabilityVersion::of(2, 0));
        assert!(CapabilityVersion::new(1, 0, 0, 1) > CapabilityVersion::of(1, 0));
    }
}

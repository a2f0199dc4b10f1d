use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` build version.
///
/// Ordering is lexicographic over (major, minor, patch), which is exactly what the
/// derived `Ord` gives us because of the field order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u32,
    minor: u32,
    patch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{input}': expected MAJOR.MINOR.PATCH")]
pub struct ParseVersionError {
    input: String,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn major(&self) -> u32 {
        self.major
    }

    pub const fn minor(&self) -> u32 {
        self.minor
    }

    pub const fn patch(&self) -> u32 {
        self.patch
    }

    /// `None` once the component is at `u32::MAX`.
    #[must_use]
    pub const fn bump_major(&self) -> Option<Self> {
        match self.major.checked_add(1) {
            Some(major) => Some(Self::new(major, 0, 0)),
            None => None,
        }
    }

    #[must_use]
    pub const fn bump_minor(&self) -> Option<Self> {
        match self.minor.checked_add(1) {
            Some(minor) => Some(Self::new(self.major, minor, 0)),
            None => None,
        }
    }

    #[must_use]
    pub const fn bump_patch(&self) -> Option<Self> {
        match self.patch.checked_add(1) {
            Some(patch) => Some(Self::new(self.major, self.minor, patch)),
            None => None,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new(0, 1, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError {
            input: s.to_string(),
        };

        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ParseVersionError> {
            parts.next().ok_or_else(err)?.parse::<u32>().map_err(|_| err())
        };
        let version = Self::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// Which component to bump when deriving the next build version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Bump {
    Major,
    Minor,
    Patch,
}

impl Bump {
    pub const fn apply(self, version: &Version) -> Option<Version> {
        match self {
            Self::Major => version.bump_major(),
            Self::Minor => version.bump_minor(),
            Self::Patch => version.bump_patch(),
        }
    }
}

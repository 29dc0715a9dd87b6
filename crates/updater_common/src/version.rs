//! Release version value type
//!
//! Versions are `major.minor.patch` triples compared lexicographically.
//! Parsing rules:
//! - a leading `v`/`V` is stripped (release tags are often `v1.2.3`)
//! - a fourth numeric field (Windows-style file revision) is accepted and ignored
//! - anything after `-` or `+` (pre-release, build metadata) is ignored
//! - fewer than three numeric fields is an error

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing a version string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,

    #[error("version '{0}' needs at least major.minor.patch")]
    TooFewFields(String),

    #[error("version '{0}' has too many fields")]
    TooManyFields(String),

    #[error("version '{input}' has a non-numeric field '{field}'")]
    InvalidField { input: String, field: String },
}

/// Semantic version triple with total ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Baseline for artifacts that have never been installed
    pub const ZERO: Version = Version::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version from a tag or metadata string
    pub fn parse(text: &str) -> Result<Self, VersionParseError> {
        let trimmed = text.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        // Drop pre-release and build metadata
        let core = trimmed
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let fields: Vec<&str> = core.split('.').collect();
        if fields.len() < 3 {
            return Err(VersionParseError::TooFewFields(text.to_string()));
        }
        if fields.len() > 4 {
            return Err(VersionParseError::TooManyFields(text.to_string()));
        }

        let mut nums = [0u64; 4];
        for (slot, field) in nums.iter_mut().zip(&fields) {
            *slot = field
                .parse()
                .map_err(|_| VersionParseError::InvalidField {
                    input: text.to_string(),
                    field: field.to_string(),
                })?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
    }

    /// Parse, falling back to `0.0.0` when the text is unusable
    pub fn parse_or_zero(text: &str) -> Self {
        Self::parse(text).unwrap_or(Self::ZERO)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

//! Local version discovery
//!
//! Installed artifacts carry an embedded what-string marker
//! `@(#)version <x.y.z>`; the first marker holding a valid version wins. A missing file,
//! a missing marker or an unparsable value all mean "never installed" and
//! map to `0.0.0` in the planner.

use crate::version::Version;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Marker preceding the embedded version string
pub const VERSION_MARKER: &[u8] = b"@(#)version ";

/// Embedded in this binary so the updater can be versioned like any artifact
#[used]
pub static AGENT_UPDATER_VERSION_MARKER: [u8; marker_len()] = marker_bytes();

const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

const fn marker_len() -> usize {
    VERSION_MARKER.len() + PKG_VERSION.len() + 1
}

const fn marker_bytes() -> [u8; marker_len()] {
    let mut out = [0u8; marker_len()];
    let version = PKG_VERSION.as_bytes();
    let mut i = 0;
    while i < VERSION_MARKER.len() {
        out[i] = VERSION_MARKER[i];
        i += 1;
    }
    let mut j = 0;
    while j < version.len() {
        out[i + j] = version[j];
        j += 1;
    }
    out
}

/// Reads the version of an installed artifact
pub trait VersionReader: Send + Sync {
    /// Raw version text, or `None` if the file or its metadata is absent
    fn read_version(&self, path: &Path) -> Option<String>;

    /// Parsed version with the `0.0.0` fallback
    fn local_version(&self, path: &Path) -> Version {
        self.read_version(path)
            .map(|text| Version::parse_or_zero(&text))
            .unwrap_or(Version::ZERO)
    }
}

/// Scans binaries for the embedded version marker
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedVersionReader;

impl VersionReader for EmbeddedVersionReader {
    fn read_version(&self, path: &Path) -> Option<String> {
        let data = fs::read(path).ok()?;
        extract_version(&data)
    }
}

/// Return the first marker token that parses as a version.
/// The scanner's own marker literal also lives in this binary, so
/// occurrences followed by junk are skipped.
pub fn extract_version(data: &[u8]) -> Option<String> {
    let mut offset = 0;
    while let Some(pos) = data[offset..]
        .windows(VERSION_MARKER.len())
        .position(|w| w == VERSION_MARKER)
    {
        let start = offset + pos + VERSION_MARKER.len();
        let rest = &data[start..];
        let end = rest
            .iter()
            .position(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+')))
            .unwrap_or(rest.len());

        if let Ok(token) = std::str::from_utf8(&rest[..end]) {
            if Version::parse(token).is_ok() {
                return Some(token.to_string());
            }
        }
        offset = start;
    }
    None
}

/// Fixed versions keyed by path (testing)
#[derive(Debug, Default, Clone)]
pub struct FixedVersionReader {
    versions: HashMap<PathBuf, String>,
}

impl FixedVersionReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<PathBuf>, version: &str) -> Self {
        self.versions.insert(path.into(), version.to_string());
        self
    }
}

impl VersionReader for FixedVersionReader {
    fn read_version(&self, path: &Path) -> Option<String> {
        self.versions.get(path).cloned()
    }
}

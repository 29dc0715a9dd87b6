//! Content digests and checksum siblings
//!
//! Every shipped artifact `<file>` has a sibling `<file>.<algo>` whose first
//! whitespace-delimited token is the hex digest of the artifact. Comparison
//! is case-insensitive.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Digest used for checksum siblings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// File name suffix of checksum siblings, including the dot
    pub fn suffix(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => ".sha1",
            ChecksumAlgorithm::Sha256 => ".sha256",
        }
    }

    /// Whether a file name (or path) is a checksum sibling
    pub fn is_checksum_file(&self, name: &str) -> bool {
        name.ends_with(self.suffix())
    }

    /// Path of the checksum sibling of `path`
    pub fn sibling_of(&self, path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(self.suffix());
        PathBuf::from(os)
    }

    /// Hex digest of a byte slice
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Hex digest of a file, streamed
    pub fn digest_file(&self, path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        match self {
            ChecksumAlgorithm::Sha1 => stream_digest::<Sha1>(file),
            ChecksumAlgorithm::Sha256 => stream_digest::<Sha256>(file),
        }
    }
}

fn stream_digest<D: Digest>(mut file: File) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Expected digest from the content of a checksum sibling
pub fn parse_checksum(content: &str) -> Option<&str> {
    content.split_whitespace().next()
}

/// Case-insensitive digest comparison
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            ChecksumAlgorithm::Sha1.digest_bytes(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            ChecksumAlgorithm::Sha256.digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_digest_matches_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.bin");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        for algo in [ChecksumAlgorithm::Sha1, ChecksumAlgorithm::Sha256] {
            assert_eq!(algo.digest_file(&path).unwrap(), algo.digest_bytes(&data));
        }
    }

    #[test]
    fn test_parse_checksum_formats() {
        assert_eq!(parse_checksum("ABCDEF plugin.so\n"), Some("ABCDEF"));
        assert_eq!(parse_checksum("abcdef\n"), Some("abcdef"));
        assert_eq!(parse_checksum("  abcdef  *plugin.so"), Some("abcdef"));
        assert_eq!(parse_checksum("\n"), None);
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(digests_match("A9993E36", "a9993e36"));
        assert!(!digests_match("a9993e36", "a9993e37"));
    }

    #[test]
    fn test_sibling_naming() {
        let algo = ChecksumAlgorithm::Sha1;
        assert_eq!(
            algo.sibling_of(Path::new("/opt/agent/plugins/http.so")),
            PathBuf::from("/opt/agent/plugins/http.so.sha1")
        );
        assert!(algo.is_checksum_file("http.so.sha1"));
        assert!(!algo.is_checksum_file("http.so"));
        assert!(!ChecksumAlgorithm::Sha256.is_checksum_file("http.so.sha1"));
    }
}

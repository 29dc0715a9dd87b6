//! Staged downloader and verifier
//!
//! Every planned file is downloaded into a flat staging directory (file name
//! only, directory structure is rebuilt at deploy time). Once all downloads
//! are done, each non-checksum file is hashed and compared to its checksum
//! sibling. Nothing here touches the live installation.

use crate::checksum::{digests_match, parse_checksum, ChecksumAlgorithm};
use crate::events::{Event, EventCode, EventSink};
use crate::planner::UpdatePlan;
use crate::transport::{HttpTransport, TransportError};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Per-file staging failures
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("download of {url} failed: {source}")]
    DownloadFailure {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("could not write {}: {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("no usable checksum for {}", .path.display())]
    ChecksumMissing { path: PathBuf },
}

impl StageFailure {
    pub fn code(&self) -> EventCode {
        match self {
            StageFailure::DownloadFailure { .. } => EventCode::RequestFailed,
            StageFailure::WriteFailure { .. } => EventCode::WriteFailed,
            StageFailure::ChecksumMismatch { .. } | StageFailure::ChecksumMissing { .. } => {
                EventCode::ChecksumFailed
            }
        }
    }

    fn is_missing_dir(&self) -> bool {
        matches!(
            self,
            StageFailure::WriteFailure { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}

/// Verification outcome of one staging pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingResult {
    staging_dir: PathBuf,
    verified: BTreeMap<PathBuf, bool>,
}

impl StagingResult {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            verified: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, dest: impl Into<PathBuf>, verified: bool) -> Self {
        self.verified.insert(dest.into(), verified);
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Staged location of a destination path
    pub fn staged_file(&self, dest: &Path) -> Option<PathBuf> {
        dest.file_name().map(|name| self.staging_dir.join(name))
    }

    pub fn is_verified(&self, dest: &Path) -> Option<bool> {
        self.verified.get(dest).copied()
    }

    /// True when every entry verified (vacuously true when empty)
    pub fn all_verified(&self) -> bool {
        self.verified.values().all(|v| *v)
    }

    pub fn unverified(&self) -> impl Iterator<Item = &Path> {
        self.verified
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(p, _)| p.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, bool)> {
        self.verified.iter().map(|(p, v)| (p.as_path(), *v))
    }

    pub fn len(&self) -> usize {
        self.verified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verified.is_empty()
    }
}

/// Downloads and verifies a plan in a staging directory
pub struct Stager<'a> {
    transport: &'a dyn HttpTransport,
    events: &'a dyn EventSink,
    staging_dir: PathBuf,
    checksum: ChecksumAlgorithm,
}

impl<'a> Stager<'a> {
    pub fn new(
        transport: &'a dyn HttpTransport,
        events: &'a dyn EventSink,
        staging_dir: impl Into<PathBuf>,
        checksum: ChecksumAlgorithm,
    ) -> Self {
        Self {
            transport,
            events,
            staging_dir: staging_dir.into(),
            checksum,
        }
    }

    pub async fn stage(&self, plan: &UpdatePlan) -> StagingResult {
        let mut downloaded = HashSet::new();

        for (dest, url) in plan.iter() {
            let Some(file_name) = dest.file_name() else {
                self.events.emit(Event::error(
                    EventCode::WriteFailed,
                    format!("File could not be saved: {} has no file name", dest.display()),
                ));
                continue;
            };
            let staged = self.staging_dir.join(file_name);

            match self.download_with_retry(url, &staged).await {
                Ok(size) => {
                    debug!("Staged {} ({} bytes)", staged.display(), size);
                    downloaded.insert(dest.to_path_buf());
                }
                Err(e) => self.events.emit(Event::error(
                    e.code(),
                    format!("File could not be saved: {}\n{}", dest.display(), e),
                )),
            }
        }

        let mut result = StagingResult::new(&self.staging_dir);
        for dest in plan.paths() {
            if self.checksum.is_checksum_file(&dest.to_string_lossy()) {
                continue;
            }

            let verified = match self.verify(dest, &downloaded).await {
                Ok(()) => true,
                Err(e) => {
                    self.events.emit(Event::error(e.code(), format!("Checksum failed\n{}", e)));
                    false
                }
            };
            result.verified.insert(dest.to_path_buf(), verified);
        }

        info!(
            "Staged {} of {} file(s), {} verified",
            downloaded.len(),
            plan.len(),
            result.iter().filter(|(_, v)| *v).count()
        );
        result
    }

    /// Download once; if the staging directory is missing, create it and
    /// retry exactly once
    async fn download_with_retry(&self, url: &str, staged: &Path) -> Result<usize, StageFailure> {
        // A stale copy from an earlier run must not pass verification
        match fs::remove_file(staged).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StageFailure::WriteFailure {
                    path: staged.to_path_buf(),
                    source: e,
                })
            }
        }

        match self.download_to(url, staged).await {
            Err(e) if e.is_missing_dir() => {
                self.events.emit(Event::info(
                    EventCode::StagingDirMissing,
                    format!(
                        "File could not be saved: staging directory {} not found; creating it",
                        self.staging_dir.display()
                    ),
                ));
                fs::create_dir_all(&self.staging_dir)
                    .await
                    .map_err(|source| StageFailure::WriteFailure {
                        path: self.staging_dir.clone(),
                        source,
                    })?;
                self.download_to(url, staged).await
            }
            other => other,
        }
    }

    async fn download_to(&self, url: &str, staged: &Path) -> Result<usize, StageFailure> {
        let bytes = self
            .transport
            .download(url)
            .await
            .map_err(|source| StageFailure::DownloadFailure {
                url: url.to_string(),
                source,
            })?;

        fs::write(staged, &bytes)
            .await
            .map_err(|source| StageFailure::WriteFailure {
                path: staged.to_path_buf(),
                source,
            })?;

        Ok(bytes.len())
    }

    async fn verify(&self, dest: &Path, downloaded: &HashSet<PathBuf>) -> Result<(), StageFailure> {
        let sibling = self.checksum.sibling_of(dest);
        if !downloaded.contains(dest) || !downloaded.contains(&sibling) {
            return Err(StageFailure::ChecksumMissing {
                path: dest.to_path_buf(),
            });
        }

        let staged = self.staging_dir.join(dest.file_name().unwrap_or_default());
        let staged_sibling = self.checksum.sibling_of(&staged);

        let content = fs::read_to_string(&staged_sibling)
            .await
            .map_err(|_| StageFailure::ChecksumMissing {
                path: dest.to_path_buf(),
            })?;
        let expected = parse_checksum(&content).ok_or_else(|| StageFailure::ChecksumMissing {
            path: dest.to_path_buf(),
        })?;

        let algorithm = self.checksum;
        let hashed = staged.clone();
        let actual = tokio::task::spawn_blocking(move || algorithm.digest_file(&hashed))
            .await
            .map_err(|e| StageFailure::WriteFailure {
                path: staged.clone(),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
            .map_err(|source| StageFailure::WriteFailure {
                path: staged.clone(),
                source,
            })?;

        if digests_match(expected, &actual) {
            Ok(())
        } else {
            Err(StageFailure::ChecksumMismatch {
                path: dest.to_path_buf(),
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::transport::{FakeTransport, HttpResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const SHA1: ChecksumAlgorithm = ChecksumAlgorithm::Sha1;

    fn plan_for(root: &Path, files: &[&str]) -> UpdatePlan {
        files
            .iter()
            .map(|f| (root.join(f), format!("https://dl.test/{}", f)))
            .collect()
    }

    #[tokio::test]
    async fn test_stage_creates_missing_dir_and_verifies() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("tmp");
        let payload = b"plugin bytes".to_vec();
        let digest = SHA1.digest_bytes(&payload).to_uppercase();

        let transport = FakeTransport::new()
            .with_bytes("https://dl.test/http.so", payload)
            .with_bytes("https://dl.test/http.so.sha1", format!("{} http.so\n", digest));
        let events = RecordingSink::new();
        let stager = Stager::new(&transport, &events, &staging, SHA1);

        let plan = plan_for(&temp.path().join("plugins"), &["http.so", "http.so.sha1"]);
        let result = stager.stage(&plan).await;

        assert_eq!(result.len(), 1);
        assert!(result.all_verified());
        assert!(staging.join("http.so").exists());
        // Only the first download hit the missing directory
        assert_eq!(events.codes(), vec![EventCode::StagingDirMissing]);
    }

    #[tokio::test]
    async fn test_stage_reports_mismatch_and_missing_sibling() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("tmp");
        std::fs::create_dir_all(&staging).unwrap();

        let transport = FakeTransport::new()
            .with_bytes("https://dl.test/a.so", b"aaa".to_vec())
            .with_bytes("https://dl.test/a.so.sha1", b"0000000000000000000000000000000000000000".to_vec())
            .with_bytes("https://dl.test/b.so", b"bbb".to_vec());
        let events = RecordingSink::new();
        let stager = Stager::new(&transport, &events, &staging, SHA1);

        let plan = plan_for(temp.path(), &["a.so", "a.so.sha1", "b.so"]);
        let result = stager.stage(&plan).await;

        assert_eq!(result.is_verified(&temp.path().join("a.so")), Some(false));
        assert_eq!(result.is_verified(&temp.path().join("b.so")), Some(false));
        assert!(!result.all_verified());
        assert_eq!(events.count(EventCode::ChecksumFailed), 2);
    }

    #[tokio::test]
    async fn test_failed_download_is_unverified_even_with_stale_copy() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("tmp");
        std::fs::create_dir_all(&staging).unwrap();

        // Leftovers from an earlier run that would verify
        std::fs::write(staging.join("c.so"), b"old").unwrap();
        std::fs::write(staging.join("c.so.sha1"), SHA1.digest_bytes(b"old")).unwrap();

        let transport = FakeTransport::new()
            .with_status("https://dl.test/c.so", 500, "boom")
            .with_bytes("https://dl.test/c.so.sha1", SHA1.digest_bytes(b"new").into_bytes());
        let events = RecordingSink::new();
        let stager = Stager::new(&transport, &events, &staging, SHA1);

        let plan = plan_for(temp.path(), &["c.so", "c.so.sha1"]);
        let result = stager.stage(&plan).await;

        assert_eq!(result.is_verified(&temp.path().join("c.so")), Some(false));
        assert_eq!(events.count(EventCode::RequestFailed), 1);
        assert!(!staging.join("c.so").exists());
    }

    /// Removes the staging directory on every download, after noting
    /// whether it was there
    struct VanishingDirTransport {
        inner: FakeTransport,
        dir: PathBuf,
        dir_present: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl HttpTransport for VanishingDirTransport {
        async fn get_text(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.inner.get_text(url).await
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
            self.dir_present.lock().unwrap().push(self.dir.exists());
            let _ = std::fs::remove_dir_all(&self.dir);
            self.inner.download(url).await
        }
    }

    #[tokio::test]
    async fn test_missing_dir_is_retried_only_once() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("tmp");
        let transport = VanishingDirTransport {
            inner: FakeTransport::new().with_bytes("https://dl.test/d.so", b"ddd".to_vec()),
            dir: staging.clone(),
            dir_present: Mutex::new(Vec::new()),
        };
        let events = RecordingSink::new();
        let stager = Stager::new(&transport, &events, &staging, SHA1);

        let plan = plan_for(temp.path(), &["d.so"]);
        let result = stager.stage(&plan).await;

        assert_eq!(result.is_verified(&temp.path().join("d.so")), Some(false));
        assert_eq!(
            transport.inner.requests(),
            vec!["https://dl.test/d.so", "https://dl.test/d.so"]
        );
        // Missing on the first attempt, created before the single retry
        assert_eq!(*transport.dir_present.lock().unwrap(), vec![false, true]);
        assert_eq!(events.count(EventCode::StagingDirMissing), 1);
        assert_eq!(events.count(EventCode::WriteFailed), 1);
    }

    #[test]
    fn test_staging_result_helpers() {
        let result = StagingResult::new("/opt/agent/tmp")
            .with_entry("/opt/agent/plugins/a.so", true)
            .with_entry("/opt/agent/b.so", false);

        assert!(!result.all_verified());
        assert_eq!(
            result.unverified().collect::<Vec<_>>(),
            vec![Path::new("/opt/agent/b.so")]
        );
        assert_eq!(
            result.staged_file(Path::new("/opt/agent/plugins/a.so")),
            Some(PathBuf::from("/opt/agent/tmp/a.so"))
        );
        assert!(StagingResult::new("/tmp").all_verified());
    }
}

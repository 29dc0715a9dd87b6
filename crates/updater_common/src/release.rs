//! Release provider - fetch "latest release" metadata from a hosting API
//!
//! Two wire schemas are supported and normalized into one `Release`:
//! - GitHub: `{ tag_name, assets: [{ name, browser_download_url }] }`
//! - GitLab: `{ name, assets: { links: [{ name, url }], count } }`
//!
//! The provider only talks to the network and decodes. It never compares
//! versions and never touches the filesystem.

use crate::events::EventCode;
use crate::transport::{HttpTransport, TransportError};
use crate::version::{Version, VersionParseError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Placeholder replaced by the assembly name in URI templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Release hosting API flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ReleaseSource {
    GitHub,
    #[default]
    GitLab,
}

impl ReleaseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseSource::GitHub => "github",
            ReleaseSource::GitLab => "gitlab",
        }
    }

    /// Path appended to a base authority that has no `{name}` placeholder
    fn latest_path(&self, name: &str) -> String {
        match self {
            ReleaseSource::GitHub => format!("{}/releases/latest", name),
            ReleaseSource::GitLab => format!("{}/releases/permalink/latest", name),
        }
    }

    /// Build the "latest release" URL for one assembly
    pub fn latest_url(&self, base: &str, name: &str) -> String {
        if base.contains(NAME_PLACEHOLDER) {
            base.replace(NAME_PLACEHOLDER, name)
        } else {
            format!("{}/{}", base.trim_end_matches('/'), self.latest_path(name))
        }
    }

    /// Decode a response body of this schema into a normalized release
    pub fn decode(&self, body: &str) -> Result<Release, ProviderError> {
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" || trimmed == "[]" {
            return Err(ProviderError::NoSuchRelease {
                reason: "empty release document".to_string(),
            });
        }

        match self {
            ReleaseSource::GitHub => decode_wire::<GitHubRelease>(trimmed),
            ReleaseSource::GitLab => decode_wire::<GitLabRelease>(trimmed),
        }
    }
}

impl fmt::Display for ReleaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ReleaseSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for ReleaseSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(ReleaseSource::GitHub),
            "gitlab" => Ok(ReleaseSource::GitLab),
            other => Err(format!("unknown release source '{}'", other)),
        }
    }
}

/// One downloadable file of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub filename: String,
    pub url: String,
}

impl ReleaseAsset {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
        }
    }
}

/// Source-agnostic latest release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub assets: Vec<ReleaseAsset>,
}

/// Errors from fetching a release
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request to {url} failed: {}", status_label(.status))]
    TransportFailure {
        status: Option<u16>,
        url: String,
        message: String,
    },

    #[error("malformed release document: {0}")]
    DecodeFailure(String),

    #[error("no release published: {reason}")]
    NoSuchRelease { reason: String },
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {}", code),
        None => "no response".to_string(),
    }
}

impl ProviderError {
    pub fn code(&self) -> EventCode {
        match self {
            ProviderError::TransportFailure { .. } => EventCode::RequestFailed,
            ProviderError::DecodeFailure(_) | ProviderError::NoSuchRelease { .. } => {
                EventCode::FetchFailed
            }
        }
    }
}

impl From<TransportError> for ProviderError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Status { status, url } => ProviderError::TransportFailure {
                status: Some(status),
                url,
                message: String::new(),
            },
            TransportError::Request { url, message } => ProviderError::TransportFailure {
                status: None,
                url,
                message,
            },
        }
    }
}

impl From<VersionParseError> for ProviderError {
    fn from(e: VersionParseError) -> Self {
        ProviderError::DecodeFailure(format!("release tag is not a version: {}", e))
    }
}

// ============================================================================
// Wire schemas
// ============================================================================

/// A decoded wire document that can be flattened into a `Release`
trait WireRelease: for<'de> Deserialize<'de> {
    fn into_release(self) -> Result<Release, ProviderError>;
}

fn decode_wire<W: WireRelease>(body: &str) -> Result<Release, ProviderError> {
    let wire: W =
        serde_json::from_str(body).map_err(|e| ProviderError::DecodeFailure(e.to_string()))?;
    wire.into_release()
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

impl WireRelease for GitHubRelease {
    fn into_release(self) -> Result<Release, ProviderError> {
        Ok(Release {
            version: Version::parse(&self.tag_name)?,
            assets: self
                .assets
                .into_iter()
                .map(|a| ReleaseAsset::new(a.name, a.browser_download_url))
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GitLabRelease {
    name: String,
    assets: GitLabAssetList,
}

#[derive(Debug, Deserialize)]
struct GitLabAssetList {
    links: Vec<GitLabLink>,
    /// Number or numeric string depending on server version
    #[serde(default)]
    count: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GitLabLink {
    name: String,
    url: String,
}

impl WireRelease for GitLabRelease {
    fn into_release(self) -> Result<Release, ProviderError> {
        debug!(
            "GitLab release {} lists {} links (count={:?})",
            self.name,
            self.assets.links.len(),
            self.assets.count
        );

        Ok(Release {
            version: Version::parse(&self.name)?,
            assets: self
                .assets
                .links
                .into_iter()
                .map(|l| ReleaseAsset::new(l.name, l.url))
                .collect(),
        })
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Fetches the latest release of an assembly
#[async_trait]
pub trait ReleaseProvider: Send + Sync {
    async fn fetch_latest(
        &self,
        source: ReleaseSource,
        base: &str,
        assembly_name: &str,
    ) -> Result<Release, ProviderError>;
}

/// Release provider over an HTTP transport
pub struct HttpReleaseProvider<T> {
    transport: T,
}

impl<T: HttpTransport> HttpReleaseProvider<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: HttpTransport> ReleaseProvider for HttpReleaseProvider<T> {
    async fn fetch_latest(
        &self,
        source: ReleaseSource,
        base: &str,
        assembly_name: &str,
    ) -> Result<Release, ProviderError> {
        let url = source.latest_url(base, assembly_name);
        debug!("Fetching latest {} release: {}", source, url);

        let response = self.transport.get_text(&url).await?;

        if !response.is_success() {
            return Err(ProviderError::TransportFailure {
                status: Some(response.status),
                url,
                message: response.body,
            });
        }

        source.decode(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;

    const GITHUB_BODY: &str = r#"{
        "tag_name": "v2.1.0",
        "name": "Release 2.1.0",
        "assets": [
            {"name": "plugin.so", "browser_download_url": "https://dl.test/plugin.so", "size": 10},
            {"name": "plugin.so.sha1", "browser_download_url": "https://dl.test/plugin.so.sha1", "size": 1}
        ]
    }"#;

    const GITLAB_BODY: &str = r#"{
        "name": "2.1.0",
        "tag_name": "release-2.1.0",
        "assets": {
            "count": 4,
            "sources": [{"format": "zip", "url": "https://dl.test/src.zip"}],
            "links": [
                {"id": 1, "name": "plugin.so", "url": "https://dl.test/plugin.so"},
                {"id": 2, "name": "plugin.so.sha1", "url": "https://dl.test/plugin.so.sha1"}
            ]
        }
    }"#;

    #[test]
    fn test_schemas_normalize_to_same_release() {
        let github = ReleaseSource::GitHub.decode(GITHUB_BODY).unwrap();
        let gitlab = ReleaseSource::GitLab.decode(GITLAB_BODY).unwrap();

        assert_eq!(github, gitlab);
        assert_eq!(github.version, Version::new(2, 1, 0));
        assert_eq!(github.assets[0], ReleaseAsset::new("plugin.so", "https://dl.test/plugin.so"));
    }

    #[test]
    fn test_gitlab_count_as_string() {
        let body = r#"{"name":"1.0.0","assets":{"count":"1","links":[{"name":"a","url":"u"}]}}"#;
        let release = ReleaseSource::GitLab.decode(body).unwrap();
        assert_eq!(release.assets.len(), 1);
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(
            ReleaseSource::GitHub.decode("{not json"),
            Err(ProviderError::DecodeFailure(_))
        ));
        // Missing mandatory field
        assert!(matches!(
            ReleaseSource::GitHub.decode(r#"{"assets": []}"#),
            Err(ProviderError::DecodeFailure(_))
        ));
        // Wrong schema for the selected source
        assert!(matches!(
            ReleaseSource::GitLab.decode(GITHUB_BODY),
            Err(ProviderError::DecodeFailure(_))
        ));
        // Unparsable tag
        assert!(matches!(
            ReleaseSource::GitHub.decode(r#"{"tag_name":"latest","assets":[]}"#),
            Err(ProviderError::DecodeFailure(_))
        ));
        assert!(matches!(
            ReleaseSource::GitLab.decode("null"),
            Err(ProviderError::NoSuchRelease { .. })
        ));
    }

    #[test]
    fn test_latest_url() {
        assert_eq!(
            ReleaseSource::GitHub.latest_url("https://api.github.test/repos/org/", "agent"),
            "https://api.github.test/repos/org/agent/releases/latest"
        );
        assert_eq!(
            ReleaseSource::GitLab.latest_url("https://gitlab.test/api/v4/projects/org%2F", "agent"),
            "https://gitlab.test/api/v4/projects/org%2F/agent/releases/permalink/latest"
        );
        assert_eq!(
            ReleaseSource::GitLab
                .latest_url("https://gitlab.test/api/v4/projects/org%2F{name}/releases/permalink/latest", "agent"),
            "https://gitlab.test/api/v4/projects/org%2Fagent/releases/permalink/latest"
        );
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("GitHub".parse::<ReleaseSource>().unwrap(), ReleaseSource::GitHub);
        assert_eq!("gitlab".parse::<ReleaseSource>().unwrap(), ReleaseSource::GitLab);
        assert!("bitbucket".parse::<ReleaseSource>().is_err());
        assert_eq!(ReleaseSource::default(), ReleaseSource::GitLab);
    }

    #[tokio::test]
    async fn test_provider_maps_statuses() {
        let base = "https://api.test/repos/org";
        let transport = FakeTransport::new()
            .with_json(&format!("{}/ok/releases/latest", base), GITHUB_BODY)
            .with_status(&format!("{}/limited/releases/latest", base), 403, "rate limited")
            .with_unreachable(&format!("{}/down/releases/latest", base), "connection refused");
        let provider = HttpReleaseProvider::new(transport);

        let release = provider
            .fetch_latest(ReleaseSource::GitHub, base, "ok")
            .await
            .unwrap();
        assert_eq!(release.assets.len(), 2);

        let err = provider
            .fetch_latest(ReleaseSource::GitHub, base, "limited")
            .await
            .unwrap_err();
        match err {
            ProviderError::TransportFailure { status, url, .. } => {
                assert_eq!(status, Some(403));
                assert_eq!(url, format!("{}/limited/releases/latest", base));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = provider
            .fetch_latest(ReleaseSource::GitHub, base, "down")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::TransportFailure { status: None, .. }));
        assert_eq!(err.code(), EventCode::RequestFailed);

        // Unpublished release: the status and URL survive for reporting
        let err = provider
            .fetch_latest(ReleaseSource::GitHub, base, "missing")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::TransportFailure {
                status: Some(404),
                url: format!("{}/missing/releases/latest", base),
                message: r#"{"message":"Not Found"}"#.to_string(),
            }
        );
        assert_eq!(err.code(), EventCode::RequestFailed);
    }

    #[test]
    fn test_source_deserializes_any_case() {
        for raw in ["\"github\"", "\"gitHub\"", "\"GitHUB\"", "\" GITHUB \""] {
            let source: ReleaseSource = serde_json::from_str(raw).unwrap();
            assert_eq!(source, ReleaseSource::GitHub);
        }
        let source: ReleaseSource = serde_json::from_str("\"gITlAB\"").unwrap();
        assert_eq!(source, ReleaseSource::GitLab);
        assert!(serde_json::from_str::<ReleaseSource>("\"bitbucket\"").is_err());
        assert_eq!(serde_json::to_string(&ReleaseSource::GitHub).unwrap(), "\"github\"");
    }
}

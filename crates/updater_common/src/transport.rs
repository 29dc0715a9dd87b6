//! HTTP transport abstraction
//!
//! The planner and the stager only need "GET text" and "GET bytes".
//! `ReqwestTransport` is the production implementation with explicit
//! timeouts; `FakeTransport` serves canned responses in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("agent-updater/", env!("CARGO_PKG_VERSION"));

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Request never produced a response (DNS, TLS, timeout, ...)
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl TransportError {
    pub fn url(&self) -> &str {
        match self {
            TransportError::Status { url, .. } | TransportError::Request { url, .. } => url,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Request { .. } => None,
        }
    }
}

/// A completed text response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP client interface
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET a URL and return status + body without judging the status
    async fn get_text(&self, url: &str) -> Result<HttpResponse, TransportError>;

    /// GET a URL as raw bytes; non-success statuses are errors
    async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    download_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration, download_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            download_timeout,
        })
    }
}

fn request_error(url: &str, e: reqwest::Error) -> TransportError {
    TransportError::Request {
        url: url.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_text(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| request_error(url, e))?;

        Ok(HttpResponse {
            status,
            url: final_url,
            body,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| request_error(url, e))
    }
}

// ============================================================================
// Fake Transport (Testing)
// ============================================================================

#[derive(Debug, Clone)]
enum FakeReply {
    Text { status: u16, body: String },
    Bytes(Vec<u8>),
    Unreachable(String),
}

/// In-memory transport with canned responses keyed by URL
#[derive(Debug, Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<String, FakeReply>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 for `url`
    pub fn with_json(self, url: &str, body: &str) -> Self {
        self.with_status(url, 200, body)
    }

    pub fn with_status(self, url: &str, status: u16, body: &str) -> Self {
        self.insert(
            url,
            FakeReply::Text {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    /// Serve raw bytes for downloads of `url`
    pub fn with_bytes(self, url: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(url, FakeReply::Bytes(bytes.into()));
        self
    }

    /// Make `url` fail without a response
    pub fn with_unreachable(self, url: &str, message: &str) -> Self {
        self.insert(url, FakeReply::Unreachable(message.to_string()));
        self
    }

    /// Every URL requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn insert(&self, url: &str, reply: FakeReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(url.to_string(), reply);
        }
    }

    fn lookup(&self, url: &str) -> Option<FakeReply> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|replies| replies.get(url).cloned())
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get_text(&self, url: &str) -> Result<HttpResponse, TransportError> {
        match self.lookup(url) {
            Some(FakeReply::Text { status, body }) => Ok(HttpResponse {
                status,
                url: url.to_string(),
                body,
            }),
            Some(FakeReply::Bytes(bytes)) => Ok(HttpResponse {
                status: 200,
                url: url.to_string(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            Some(FakeReply::Unreachable(message)) => Err(TransportError::Request {
                url: url.to_string(),
                message,
            }),
            None => Ok(HttpResponse {
                status: 404,
                url: url.to_string(),
                body: r#"{"message":"Not Found"}"#.to_string(),
            }),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        match self.lookup(url) {
            Some(FakeReply::Bytes(bytes)) => Ok(bytes),
            Some(FakeReply::Text { status, body }) if (200..300).contains(&status) => {
                Ok(body.into_bytes())
            }
            Some(FakeReply::Text { status, .. }) => Err(TransportError::Status {
                status,
                url: url.to_string(),
            }),
            Some(FakeReply::Unreachable(message)) => Err(TransportError::Request {
                url: url.to_string(),
                message,
            }),
            None => Err(TransportError::Status {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_transport_serves_and_records() {
        let transport = FakeTransport::new()
            .with_json("https://releases.test/a", r#"{"tag_name":"1.0.0"}"#)
            .with_bytes("https://releases.test/a.bin", vec![1u8, 2, 3]);

        let response = transport.get_text("https://releases.test/a").await.unwrap();
        assert!(response.is_success());
        assert!(response.body.contains("tag_name"));

        let bytes = transport.download("https://releases.test/a.bin").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_fake_transport_unknown_url_is_404() {
        let transport = FakeTransport::new();

        let response = transport.get_text("https://releases.test/missing").await.unwrap();
        assert_eq!(response.status, 404);

        let err = transport.download("https://releases.test/missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.url(), "https://releases.test/missing");
    }

    #[test]
    fn test_reqwest_transport_builds() {
        let transport = ReqwestTransport::new(Duration::from_secs(5), Duration::from_secs(60));
        assert!(transport.is_ok());
    }
}

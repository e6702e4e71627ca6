use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::model::{server_id_from_json, OutgoingQuote, RemoteQuote, ServerId};
use crate::ErrorKind;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_RESPONSE_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, RemoteError> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(RemoteError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if trimmed.len() > MAX_URL_LENGTH {
            return Err(RemoteError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(trimmed).map_err(|e| RemoteError::InvalidUrl {
            url: Self::truncate_url(trimmed),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(RemoteError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| RemoteError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(RemoteError::InvalidUrl {
                url: Self::truncate_url(trimmed),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let cut = (0..=100).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
            format!("{}...", &url[..cut])
        }
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("remote unavailable: {message}")]
    Unavailable { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl RemoteError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Unavailable { .. } | RemoteError::Timeout { .. } => true,
            RemoteError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            RemoteError::InvalidUrl { .. } | RemoteError::InvalidResponse { .. } => false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::InvalidUrl { .. } => ErrorKind::Config,
            RemoteError::Unavailable { .. } | RemoteError::Status { .. } => {
                ErrorKind::RemoteUnavailable
            }
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::InvalidResponse { .. } => ErrorKind::Parse,
        }
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        RemoteError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return RemoteError::Timeout { timeout_ms: 0 };
        }
        if e.is_decode() {
            return RemoteError::InvalidResponse {
                reason: e.to_string(),
            };
        }
        if let Some(status) = e.status() {
            return RemoteError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        RemoteError::Unavailable {
            message: e.to_string(),
        }
    }
}

fn body_too_large(len: u64) -> RemoteError {
    RemoteError::InvalidResponse {
        reason: format!(
            "response body too large: {len} bytes exceeds maximum of {MAX_RESPONSE_BODY_SIZE} bytes"
        ),
    }
}

/// The server side of reconciliation: a collection that can be listed and
/// appended to.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Vec<RemoteQuote>, RemoteError>;
    async fn push_quote(&self, quote: &OutgoingQuote) -> Result<ServerId, RemoteError>;
}

#[derive(Deserialize)]
struct CreatedResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
}

/// JSON-over-HTTP endpoint. `GET` returns an array of items, `POST` echoes
/// the created item with its assigned `id`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    endpoint: ValidatedUrl,
}

impl HttpRemote {
    pub fn new(endpoint: ValidatedUrl, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub fn endpoint(&self) -> &ValidatedUrl {
        &self.endpoint
    }

    /// Reads a successful body chunk by chunk, stopping at
    /// `MAX_RESPONSE_BODY_SIZE`. A declared length over the limit fails
    /// before anything is read.
    async fn read_body(mut response: reqwest::Response) -> Result<Vec<u8>, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let message: String = response
                .chunk()
                .await
                .ok()
                .flatten()
                .map(|chunk| String::from_utf8_lossy(&chunk).chars().take(200).collect())
                .unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if let Some(declared) = response.content_length() {
            if usize::try_from(declared).map_or(true, |len| len > MAX_RESPONSE_BODY_SIZE) {
                return Err(body_too_large(declared));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_RESPONSE_BODY_SIZE {
                return Err(body_too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    #[instrument(skip(self), fields(host = %self.endpoint.host()))]
    async fn fetch_snapshot(&self) -> Result<Vec<RemoteQuote>, RemoteError> {
        let response = self
            .client
            .get(self.endpoint.as_str())
            .header("Accept", "application/json")
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        let items: Vec<RemoteQuote> =
            serde_json::from_slice(&body).map_err(|e| RemoteError::InvalidResponse {
                reason: format!("expected a JSON array: {e}"),
            })?;
        debug!(count = items.len(), "fetched remote snapshot");
        Ok(items)
    }

    #[instrument(skip(self, quote), fields(host = %self.endpoint.host()))]
    async fn push_quote(&self, quote: &OutgoingQuote) -> Result<ServerId, RemoteError> {
        let response = self
            .client
            .post(self.endpoint.as_str())
            .json(quote)
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        let created: CreatedResponse =
            serde_json::from_slice(&body).map_err(|e| RemoteError::InvalidResponse {
                reason: e.to_string(),
            })?;
        created
            .id
            .as_ref()
            .and_then(server_id_from_json)
            .ok_or_else(|| RemoteError::InvalidResponse {
                reason: "created item has no id".to_string(),
            })
    }
}

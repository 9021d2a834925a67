use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/MrDerekib/maximo-client-v2/releases/latest";

/// Bounded attempts with a per-attempt timeout and a doubling pause between
/// attempts. The first attempt never waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt with a short timeout.
    pub fn single(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_before_attempt(&self, attempt_index: usize) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32
            .checked_shl((attempt_index - 1) as u32)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed release document: {0}")]
    Malformed(String),
}

/// The part of a release-feed response the checker reads. Absent fields
/// read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReleaseDocument {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl ReleaseDocument {
    pub fn tag(&self) -> String {
        self.tag_name.as_deref().unwrap_or_default().trim().to_string()
    }

    pub fn url(&self) -> String {
        self.html_url.as_deref().unwrap_or_default().trim().to_string()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CheckError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CheckError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(CheckError::Malformed("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| CheckError::Malformed(e.to_string()))
    }
}

#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    async fn latest_release(&self, timeout: Duration) -> Result<ReleaseDocument, CheckError>;
}

#[derive(Debug, Clone)]
pub struct HttpReleaseFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpReleaseFeed {
    pub fn new(url: impl Into<String>, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(user_agent.to_string())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReleaseFeed for HttpReleaseFeed {
    async fn latest_release(&self, timeout: Duration) -> Result<ReleaseDocument, CheckError> {
        let span = info_span!("release_feed", url = %self.url, timeout_secs = timeout.as_secs());
        async {
            let resp = self
                .client
                .get(&self.url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        CheckError::Timeout(timeout)
                    } else {
                        CheckError::Request(e)
                    }
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(CheckError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "release document received");
            ReleaseDocument::parse(&body)
        }
        .instrument(span)
        .await
    }
}

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use otsync_core::VersionInfo;
use otsync_storage::{BackoffPolicy, CheckError, ReleaseFeed};
use tracing::{debug, info, warn};

/// Numeric `(major, minor, patch)` pulled out of a free-form tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionTriple {
    /// First `X.Y` or `X.Y.Z` run in `text`. Patch defaults to 0; no match
    /// gives `0.0.0`.
    pub fn parse(text: &str) -> Self {
        Self::find(text).unwrap_or_default()
    }

    pub fn find(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if !bytes[start].is_ascii_digit() {
                start += 1;
                continue;
            }
            let (major, after_major) = digit_run(bytes, start);
            if let Some((minor, after_minor)) = dotted_run(bytes, after_major) {
                let patch = dotted_run(bytes, after_minor).map_or(0, |(p, _)| p);
                return Some(Self {
                    major,
                    minor,
                    patch,
                });
            }
            start = after_major;
        }
        None
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse the digits starting at `start`; values that overflow saturate.
fn digit_run(bytes: &[u8], start: usize) -> (u64, usize) {
    let mut value: u64 = 0;
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add(u64::from(bytes[end] - b'0'));
        end += 1;
    }
    (value, end)
}

fn dotted_run(bytes: &[u8], at: usize) -> Option<(u64, usize)> {
    if bytes.get(at) == Some(&b'.') && bytes.get(at + 1).is_some_and(u8::is_ascii_digit) {
        Some(digit_run(bytes, at + 1))
    } else {
        None
    }
}

pub fn compare_versions(remote: &str, local: &str) -> Ordering {
    VersionTriple::parse(remote).cmp(&VersionTriple::parse(local))
}

pub fn is_newer(remote: &str, local: &str) -> bool {
    compare_versions(remote, local) == Ordering::Greater
}

/// `vX.Y.Z` for display, or the raw tag when it carries no version.
pub fn format_version_tag(tag: &str) -> String {
    match VersionTriple::find(tag) {
        Some(triple) => format!("v{triple}"),
        None => tag.trim().to_string(),
    }
}

pub struct VersionChecker {
    feed: Arc<dyn ReleaseFeed>,
    local_version: String,
}

impl VersionChecker {
    pub fn new(feed: Arc<dyn ReleaseFeed>, local_version: impl Into<String>) -> Self {
        Self {
            feed,
            local_version: local_version.into(),
        }
    }

    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    pub fn policy_for(urgent: bool) -> BackoffPolicy {
        if urgent {
            BackoffPolicy::default()
        } else {
            BackoffPolicy::single(Duration::from_secs(5))
        }
    }

    /// Poll the feed under the retry policy for `urgent`. Failures are
    /// logged, never returned.
    pub async fn check(&self, urgent: bool) -> Option<VersionInfo> {
        let policy = Self::policy_for(urgent);
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(
                policy.attempt_timeout,
                self.feed.latest_release(policy.attempt_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CheckError::Timeout(policy.attempt_timeout)),
            };

            match result {
                Ok(doc) => {
                    let info = VersionInfo {
                        tag: doc.tag(),
                        url: doc.url(),
                        checked_at: Utc::now(),
                    };
                    info!(tag = %info.tag, attempt = attempt + 1, "release feed checked");
                    return Some(info);
                }
                Err(err) => {
                    debug!(attempt = attempt + 1, error = %err, "release check attempt failed");
                }
            }
        }
        warn!(
            urgent,
            attempts = policy.max_attempts,
            "release check gave up"
        );
        None
    }

    /// Prompt the user only for urgent checks that found a complete, newer
    /// release.
    pub fn should_notify(&self, urgent: bool, info: Option<&VersionInfo>) -> bool {
        match info {
            Some(info) if urgent => {
                !info.tag.is_empty()
                    && !info.url.is_empty()
                    && is_newer(&info.tag, &self.local_version)
            }
            _ => false,
        }
    }
}

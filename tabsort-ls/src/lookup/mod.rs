//! Metadata lookup boundary
//!
//! The pipeline only sees the [`MetadataSource`] trait. The production
//! implementation shells out to `yt-dlp` ([`yt_dlp::YtDlpSource`]); tests
//! substitute scripted sources.
//!
//! Failures come in two kinds:
//! - **Definitive** ([`LookupError::Unavailable`]): the video is gone or
//!   private. Never retried.
//! - **Transient** (everything else): retried up to the configured number
//!   of attempts with a fixed backoff, then given up.

pub mod yt_dlp;

use async_trait::async_trait;
use std::time::Duration;
use tabsort_common::canonical::CanonicalUrl;
use tabsort_common::classify::LookupPayload;
use thiserror::Error;
use tracing::{error, warn};

pub use yt_dlp::YtDlpSource;

/// Metadata lookup errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// Content is definitively unavailable (removed, private, region-locked)
    #[error("Content unavailable: {0}")]
    Unavailable(String),

    /// Lookup failed in a way that may succeed on retry
    #[error("Transient lookup failure: {0}")]
    Transient(String),

    /// The lookup tool is not installed or not executable
    #[error("Lookup tool not available: {0}")]
    NotInstalled(String),

    /// The lookup answered with something that is not metadata
    #[error("Parse error: {0}")]
    Parse(String),
}

impl LookupError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LookupError::Transient(_) | LookupError::Parse(_))
    }
}

/// Source of video metadata
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Source name for diagnostics
    fn name(&self) -> &'static str;

    /// Perform one lookup attempt
    async fn lookup(&self, url: &CanonicalUrl) -> Result<LookupPayload, LookupError>;
}

/// Bounded retry policy for lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// Look up metadata, retrying transient failures per `policy`
///
/// Definitive failures and missing tools return immediately. The returned
/// error is the last one observed.
pub async fn fetch_with_retry(
    source: &dyn MetadataSource,
    url: &CanonicalUrl,
    policy: RetryPolicy,
) -> Result<LookupPayload, LookupError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match source.lookup(url).await {
            Ok(payload) => return Ok(payload),
            Err(e) if !e.is_retryable() => {
                warn!(url = %url, source = source.name(), error = %e, "Lookup failed, not retrying");
                return Err(e);
            }
            Err(e) if attempt < policy.attempts => {
                warn!(
                    url = %url,
                    source = source.name(),
                    error = %e,
                    "Lookup failed. Retry {}/{}",
                    attempt,
                    policy.attempts
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => {
                error!(
                    url = %url,
                    source = source.name(),
                    error = %e,
                    "Lookup failed after {} attempts",
                    policy.attempts
                );
                return Err(e);
            }
        }
    }
}

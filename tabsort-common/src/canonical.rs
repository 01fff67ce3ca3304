//! Video URL canonicalization
//!
//! Every URL shape the browser extension can report for a single video
//! (watch pages, `youtu.be` short links, embeds, shorts, live pages) is
//! rewritten into one fixed form:
//!
//! ```text
//! https://www.youtube.com/watch?v=<11-character id>
//! ```
//!
//! The canonical form is the dedup key for the classification logs, so two
//! raw URLs that point at the same video must always produce the same string.
//! Canonicalization is pure: malformed input yields `None`, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every canonical URL
pub const CANONICAL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// Required video identifier length
pub const VIDEO_ID_LEN: usize = 11;

/// Watch page: `youtube.com/watch?...v=<id>...`
static WATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?://)?(?:(?:www|m|music)\.)?youtube\.com/watch/?\?(?:[^#]*&)?v=([^&#]*)")
        .expect("watch pattern is valid")
});

/// Short domain: `youtu.be/<id>`
static SHORT_DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.)?youtu\.be/([^?&#/]*)").expect("short domain pattern is valid")
});

/// Path forms: `/embed/<id>`, `/shorts/<id>`, `/live/<id>`, `/v/<id>`
static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:(?:www|m|music)\.)?youtube(?:-nocookie)?\.com/(?:embed|shorts|live|v)/([^?&#/]*)",
    )
    .expect("path pattern is valid")
});

static VIDEO_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern is valid"));

/// A normalized watch URL identifying exactly one video
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    /// Build the canonical URL for an already-validated video id
    fn from_video_id(id: &str) -> Self {
        Self(format!("{}{}", CANONICAL_PREFIX, id))
    }

    /// Accept a string only if it is already in canonical form
    ///
    /// Used when reloading persisted logs: anything that would be rewritten
    /// by [`canonicalize`] is not a valid stored key.
    pub fn from_canonical(s: &str) -> Option<Self> {
        match canonicalize(s) {
            Some(url) if url.as_str() == s => Some(url),
            _ => None,
        }
    }

    /// The full canonical URL
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 11-character video identifier
    pub fn video_id(&self) -> &str {
        &self.0[CANONICAL_PREFIX.len()..]
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalize a raw video URL
///
/// Returns `None` when no supported pattern matches or when the extracted
/// identifier is not exactly 11 URL-safe characters.
///
/// # Examples
///
/// ```
/// use tabsort_common::canonicalize;
///
/// let url = canonicalize("https://youtu.be/dQw4w9WgXcQ?t=42").unwrap();
/// assert_eq!(url.as_str(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
/// assert!(canonicalize("https://example.com/watch?v=dQw4w9WgXcQ").is_none());
/// ```
pub fn canonicalize(raw: &str) -> Option<CanonicalUrl> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let candidate = [&*WATCH_RE, &*SHORT_DOMAIN_RE, &*PATH_RE]
        .iter()
        .find_map(|re| re.captures(raw))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())?;

    if candidate.len() != VIDEO_ID_LEN || !VIDEO_ID_RE.is_match(candidate) {
        tracing::debug!(url = %raw, id = %candidate, "Extracted video id looks invalid");
        return None;
    }

    Some(CanonicalUrl::from_video_id(candidate))
}

//! yt-dlp metadata source
//!
//! Runs the `yt-dlp` command-line tool in metadata-only mode and parses its
//! single JSON document:
//!
//! ```text
//! yt-dlp --dump-single-json --flat-playlist --skip-download --no-warnings \
//!        --no-check-certificates --geo-bypass <url>
//! ```
//!
//! The tool must be installed separately (`pip install yt-dlp` or a distro
//! package). A missing binary is reported as [`LookupError::NotInstalled`]
//! and is not retried.

use super::{LookupError, MetadataSource};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tabsort_common::canonical::CanonicalUrl;
use tabsort_common::classify::LookupPayload;
use tokio::process::Command;
use tracing::debug;

/// Upper bound for a single yt-dlp invocation
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Error output fragments that mean the video will never be available
const UNAVAILABLE_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "is not available",
    "members-only",
    "sign in to confirm your age",
    "account associated with this video has been terminated",
];

/// yt-dlp backed [`MetadataSource`]
pub struct YtDlpSource {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlpSource {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: INVOCATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check whether the binary runs at all (`--version`)
    pub async fn is_available(&self) -> bool {
        let result = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let available = result.map(|status| status.success()).unwrap_or(false);
        debug!(binary = %self.binary.display(), available, "yt-dlp availability check");
        available
    }
}

#[async_trait]
impl MetadataSource for YtDlpSource {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn lookup(&self, url: &CanonicalUrl) -> Result<LookupPayload, LookupError> {
        debug!(url = %url, "Querying yt-dlp");

        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--dump-single-json",
            "--flat-playlist",
            "--skip-download",
            "--no-warnings",
            "--no-check-certificates",
            "--geo-bypass",
        ])
        .arg(url.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LookupError::NotInstalled(format!(
                    "{} not found",
                    self.binary.display()
                )));
            }
            Ok(Err(e)) => {
                return Err(LookupError::Transient(format!(
                    "failed to execute {}: {}",
                    self.binary.display(),
                    e
                )))
            }
            Err(_) => {
                return Err(LookupError::Transient(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        parse_output(&output.stdout)
    }
}

/// Map yt-dlp error output to a definitive or transient failure
fn classify_failure(stderr: &str) -> LookupError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("yt-dlp exited with an error")
        .trim()
        .to_string();
    let lower = stderr.to_lowercase();
    if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        LookupError::Unavailable(message)
    } else {
        LookupError::Transient(message)
    }
}

fn parse_output(stdout: &[u8]) -> Result<LookupPayload, LookupError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| LookupError::Parse(e.to_string()))?;
    LookupPayload::from_value(value)
        .ok_or_else(|| LookupError::Parse("metadata is not a JSON object".to_string()))
}

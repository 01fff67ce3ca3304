//! Event pipeline
//!
//! One inbound record flows through:
//!
//! ```text
//! parse → canonicalize → dedup check → metadata lookup → classify → record
//! ```
//!
//! Each step is a gate: a failure drops the record with a diagnostic and
//! nothing is written. Failed lookups are not recorded, so the same URL
//! is retried the next time the extension reports it.
//!
//! A URL is claimed in the in-flight set before the dedup check and
//! released on every exit path, so two records for the same URL arriving
//! together are processed once.
//!
//! Lookups are bounded by a semaphore; each one is an external process.
//! The permit is taken after the dedup check, so known URLs never queue.

use crate::dedup::DedupStore;
use crate::lookup::{fetch_with_retry, LookupError, MetadataSource, RetryPolicy};
use crate::protocol::{parse_inbound, Inbound};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tabsort_common::canonical::{canonicalize, CanonicalUrl};
use tabsort_common::classify::{explain_payload, Bucket, LookupPayload};
use tabsort_common::events::{EventBus, SkipReason, TabsortEvent};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Why a record was dropped before any lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    MissingUrl,
    NotVideoUrl,
    Keepalive,
}

/// Result of processing one record
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Dropped(DropReason),
    Skipped(CanonicalUrl, SkipReason),
    LookupFailed(CanonicalUrl, LookupError),
    Recorded {
        url: CanonicalUrl,
        title: String,
        bucket: Bucket,
    },
    /// Classification computed but the log append failed
    WriteFailed(CanonicalUrl),
}

/// Releases an in-flight claim when dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<CanonicalUrl>>,
    url: CanonicalUrl,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.url);
        }
    }
}

/// Shared pipeline used by every session
pub struct Pipeline {
    dedup: Arc<DedupStore>,
    source: Arc<dyn MetadataSource>,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<CanonicalUrl>>,
    lookups: Semaphore,
    tasks: TaskTracker,
    event_bus: EventBus,
}

impl Pipeline {
    pub fn new(
        dedup: Arc<DedupStore>,
        source: Arc<dyn MetadataSource>,
        retry: RetryPolicy,
        max_concurrent_lookups: usize,
        event_bus: EventBus,
    ) -> Self {
        Self {
            dedup,
            source,
            retry,
            in_flight: Mutex::new(HashSet::new()),
            lookups: Semaphore::new(max_concurrent_lookups.max(1)),
            tasks: TaskTracker::new(),
            event_bus,
        }
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    /// Process a record in the background
    ///
    /// The session keeps reading while lookups are in progress; at most
    /// `max_concurrent_lookups` of them run at once.
    pub fn spawn_process(self: &Arc<Self>, text: String) {
        let pipeline = Arc::clone(self);
        self.tasks.spawn(async move {
            pipeline.process(&text).await;
        });
    }

    /// Wait for background processing to finish (used at shutdown)
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Process one raw text frame from the primary session
    pub async fn process(&self, text: &str) -> Outcome {
        match parse_inbound(text) {
            Inbound::Url(raw) => self.process_url(&raw).await,
            Inbound::Pong => Outcome::Dropped(DropReason::Keepalive),
            Inbound::MissingUrl => {
                warn!("Received message with no 'url' field");
                Outcome::Dropped(DropReason::MissingUrl)
            }
            Inbound::Malformed => {
                warn!("Invalid JSON received");
                Outcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Process one raw URL
    pub async fn process_url(&self, raw: &str) -> Outcome {
        let Some(url) = canonicalize(raw) else {
            warn!(url = %raw, "Could not canonicalize URL");
            return Outcome::Dropped(DropReason::NotVideoUrl);
        };

        let Some(_guard) = self.claim(&url) else {
            debug!(url = %url, "URL already being processed, skipping");
            return self.skipped(url, SkipReason::InFlight);
        };

        if self.dedup.contains(&url).await {
            info!(url = %url, "URL already processed. Skipping.");
            return self.skipped(url, SkipReason::AlreadyRecorded);
        }

        let fetched = {
            // The semaphore is never closed
            let _permit = self.lookups.acquire().await.ok();
            fetch_with_retry(self.source.as_ref(), &url, self.retry).await
        };
        let payload = match fetched {
            Ok(payload) => payload,
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to get video info");
                self.event_bus.emit_lossy(TabsortEvent::LookupFailed {
                    url: url.clone(),
                    error: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                return Outcome::LookupFailed(url, e);
            }
        };

        let (bucket, title) = decide(&payload);

        match self.dedup.record(&url, &title, bucket).await {
            Ok(true) => {
                info!(url = %url, bucket = %bucket, "Logged {}: {} | {}", bucket, url, title);
                self.event_bus.emit_lossy(TabsortEvent::UrlClassified {
                    url: url.clone(),
                    title: title.clone(),
                    bucket,
                    timestamp: chrono::Utc::now(),
                });
                Outcome::Recorded { url, title, bucket }
            }
            Ok(false) => self.skipped(url, SkipReason::AlreadyRecorded),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to append classification record");
                Outcome::WriteFailed(url)
            }
        }
    }

    fn claim(&self, url: &CanonicalUrl) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(url.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            url: url.clone(),
        })
    }

    fn skipped(&self, url: CanonicalUrl, reason: SkipReason) -> Outcome {
        self.event_bus.emit_lossy(TabsortEvent::UrlSkipped {
            url: url.clone(),
            reason,
            timestamp: chrono::Utc::now(),
        });
        Outcome::Skipped(url, reason)
    }
}

/// Classify a payload and pick the title to record
fn decide(payload: &LookupPayload) -> (Bucket, String) {
    let title = payload.title().to_string();
    let reason = explain_payload(payload);
    match &reason {
        Some(reason) => debug!(title = %title, "Music identified by {}", reason),
        None => debug!(title = %title, "Not identified as music based on heuristics"),
    }
    (Bucket::from_is_music(reason.is_some()), title)
}

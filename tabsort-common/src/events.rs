//! Service event types and the EventBus
//!
//! The listener service broadcasts lifecycle and classification events so
//! that the console, diagnostics and integration tests can observe
//! arbitration without reaching into its internals.

use crate::canonical::CanonicalUrl;
use crate::classify::Bucket;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a URL was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Already present in one of the classification logs
    AlreadyRecorded,
    /// Another message for the same URL is being processed right now
    InFlight,
}

/// tabsort event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TabsortEvent {
    /// Listener pool bound the given ports (cycle numbers start at 1)
    PoolStarted {
        cycle: u64,
        ports: Vec<u16>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Every configured port failed to bind; pool start will be retried
    PoolStartFailed {
        cycle: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A session won the election and non-primary listeners were closed
    PrimaryEstablished {
        port: u16,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The primary session ended; a restart cycle follows
    PrimaryDisconnected {
        port: u16,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A URL was classified and appended to its bucket log
    UrlClassified {
        url: CanonicalUrl,
        title: String,
        bucket: Bucket,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A URL was not processed
    UrlSkipped {
        url: CanonicalUrl,
        reason: SkipReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Metadata lookup gave up; nothing was recorded
    LookupFailed {
        url: CanonicalUrl,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast channel for [`TabsortEvent`]
///
/// Cloning is cheap; all clones share one channel. Events emitted before a
/// receiver subscribes are not delivered to it.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TabsortEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<TabsortEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TabsortEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

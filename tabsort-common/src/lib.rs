//! # tabsort Common Library
//!
//! Shared code for the tabsort listener service and its tests:
//! - Configuration loading and data folder resolution
//! - Video URL canonicalization
//! - Music/non-music classification heuristics
//! - Service event types (TabsortEvent enum) and the EventBus
//! - Common error types

pub mod canonical;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;

pub use canonical::{canonicalize, CanonicalUrl};
pub use classify::{classify, Bucket, MatchReason, Metadata};
pub use error::{Error, Result};

//! Music/non-music classification heuristics
//!
//! Classification is an ordered list of rules evaluated against the
//! metadata returned by the lookup service. The first rule that fires
//! decides "music"; if none fire the video is "non-music".
//!
//! 1. Title keyword (official video, lyrics, remix, ...)
//! 2. Tag containing "music" or equal to a title keyword
//! 3. Description phrase (album, single, stream now, music video)
//! 4. Category containing "music"
//! 5. Label/artist channel (VEVO, "- Topic", official artist channel)
//!
//! Missing fields are treated as empty. Metadata is parsed leniently from
//! the lookup JSON: nulls, non-string tags and non-array lists never fail.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Title markers, also matched exactly against tags
pub const MUSIC_KEYWORDS: &[&str] = &[
    "official video",
    "lyrics",
    "remix",
    "cover",
    "audio",
    "ft.",
    "feat",
    "mv",
];

/// Description phrases (padded with spaces so "single" inside words doesn't match)
pub const DESCRIPTION_PHRASES: &[&str] = &[" album ", " single ", " stream now ", "music video"];

/// Channel name markers for label aggregators and auto-generated artist channels
pub const CHANNEL_MARKERS: &[&str] = &["vevo", "topic"];

/// Description marker for verified artist channels
pub const OFFICIAL_ARTIST_MARKER: &str = "official artist channel";

/// Title used when the lookup returns none
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Music,
    NonMusic,
}

impl Bucket {
    pub fn from_is_music(is_music: bool) -> Self {
        if is_music {
            Bucket::Music
        } else {
            Bucket::NonMusic
        }
    }

    pub fn is_music(self) -> bool {
        matches!(self, Bucket::Music)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Music => f.write_str("MUSIC"),
            Bucket::NonMusic => f.write_str("NON-MUSIC"),
        }
    }
}

/// Which rule decided "music"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "matched", rename_all = "snake_case")]
pub enum MatchReason {
    TitleKeyword(String),
    Tag(String),
    DescriptionPhrase(String),
    Category(String),
    Channel(String),
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::TitleKeyword(k) => write!(f, "title keyword '{}'", k),
            MatchReason::Tag(t) => write!(f, "tag '{}'", t),
            MatchReason::DescriptionPhrase(p) => write!(f, "description phrase '{}'", p.trim()),
            MatchReason::Category(c) => write!(f, "category '{}'", c),
            MatchReason::Channel(c) => write!(f, "channel pattern '{}'", c),
        }
    }
}

/// Metadata for a single video
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub channel: String,
}

impl Metadata {
    /// Title to record, falling back to [`UNKNOWN_TITLE`]
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            UNKNOWN_TITLE
        } else {
            &self.title
        }
    }
}

/// Raw lookup result shape
///
/// The lookup service sometimes answers with a playlist wrapper instead of
/// a single video record. The wrapper is resolved to its first entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupPayload {
    Single(Metadata),
    Playlist {
        title: Option<String>,
        entries: Vec<Metadata>,
    },
}

impl LookupPayload {
    /// Interpret a JSON document from the lookup service
    ///
    /// Returns `None` for shapes that are not JSON objects.
    pub fn from_value(value: Value) -> Option<Self> {
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                warn!(kind = %json_kind(&other), "Unexpected metadata shape from lookup");
                return None;
            }
        };

        let is_playlist = obj.get("_type").and_then(Value::as_str) == Some("playlist");
        if is_playlist {
            if let Some(Value::Array(raw_entries)) = obj.get("entries") {
                let title = obj
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let entries = raw_entries
                    .iter()
                    .filter_map(|entry| parse_metadata(entry.clone()))
                    .collect();
                return Some(LookupPayload::Playlist { title, entries });
            }
        }

        parse_metadata(Value::Object(obj)).map(LookupPayload::Single)
    }

    /// Resolve to a single video's metadata, or `None` for an empty playlist
    pub fn resolve(&self) -> Option<&Metadata> {
        match self {
            LookupPayload::Single(meta) => Some(meta),
            LookupPayload::Playlist { entries, .. } => entries.first(),
        }
    }

    /// Title to record for this payload
    pub fn title(&self) -> &str {
        match self {
            LookupPayload::Single(meta) => meta.display_title(),
            LookupPayload::Playlist { title: Some(t), .. } if !t.trim().is_empty() => t,
            LookupPayload::Playlist { entries, .. } => entries
                .first()
                .map(Metadata::display_title)
                .unwrap_or(UNKNOWN_TITLE),
        }
    }
}

fn parse_metadata(value: Value) -> Option<Metadata> {
    match serde_json::from_value::<Metadata>(value) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(error = %e, "Failed to interpret metadata record");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Classify metadata as music (`true`) or non-music (`false`)
pub fn classify(meta: &Metadata) -> bool {
    explain(meta).is_some()
}

/// [`explain`] for a lookup payload; an empty playlist has insufficient data and is non-music
pub fn explain_payload(payload: &LookupPayload) -> Option<MatchReason> {
    match payload.resolve() {
        Some(meta) => explain(meta),
        None => {
            debug!("Playlist with no entries, cannot determine if music");
            None
        }
    }
}

/// Return the first rule that identifies the metadata as music
pub fn explain(meta: &Metadata) -> Option<MatchReason> {
    let title = meta.title.to_lowercase();
    let tags: Vec<String> = meta.tags.iter().map(|t| t.to_lowercase()).collect();
    let description = meta.description.to_lowercase();
    let categories: Vec<String> = meta.categories.iter().map(|c| c.to_lowercase()).collect();
    let channel = meta.channel.to_lowercase();

    if let Some(keyword) = MUSIC_KEYWORDS.iter().find(|k| title.contains(*k)) {
        return Some(MatchReason::TitleKeyword(keyword.to_string()));
    }

    if let Some(tag) = tags
        .iter()
        .find(|t| t.contains("music") || MUSIC_KEYWORDS.contains(&t.as_str()))
    {
        return Some(MatchReason::Tag(tag.clone()));
    }

    if let Some(phrase) = DESCRIPTION_PHRASES.iter().find(|p| description.contains(*p)) {
        return Some(MatchReason::DescriptionPhrase(phrase.to_string()));
    }

    if let Some(category) = categories.iter().find(|c| c.contains("music")) {
        return Some(MatchReason::Category(category.clone()));
    }

    if let Some(marker) = CHANNEL_MARKERS.iter().find(|m| channel.contains(*m)) {
        return Some(MatchReason::Channel(marker.to_string()));
    }
    if description.contains(OFFICIAL_ARTIST_MARKER) {
        return Some(MatchReason::Channel(OFFICIAL_ARTIST_MARKER.to_string()));
    }

    None
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(scalar_to_string(&value).unwrap_or_default())
}

fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(scalar_to_string).collect(),
        _ => Vec::new(),
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

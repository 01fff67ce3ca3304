//! Dedup store: classification logs and their in-memory index
//!
//! Two append-only UTF-8 logs, one per bucket, each line
//! `<canonical url> | <title>`. The logs are read completely at startup;
//! afterwards every new classification is appended to its log and inserted
//! into the matching in-memory set. Logs are never rewritten or compacted.
//!
//! An append that failed partway can leave a line without its newline;
//! the next append to that log terminates it first.

use crate::error::Result;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tabsort_common::canonical::CanonicalUrl;
use tabsort_common::classify::Bucket;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Field separator inside a log line
pub const SEPARATOR: &str = " | ";

/// Counts of entries loaded from one log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct Index {
    music: HashSet<CanonicalUrl>,
    non_music: HashSet<CanonicalUrl>,
}

impl Index {
    fn bucket_of(&self, url: &CanonicalUrl) -> Option<Bucket> {
        if self.music.contains(url) {
            Some(Bucket::Music)
        } else if self.non_music.contains(url) {
            Some(Bucket::NonMusic)
        } else {
            None
        }
    }
}

/// Persistent set of already-classified URLs
pub struct DedupStore {
    index: RwLock<Index>,
    music_path: PathBuf,
    non_music_path: PathBuf,
}

impl DedupStore {
    /// Load both logs; missing files are treated as empty
    ///
    /// Malformed lines are skipped with a warning. A URL found in both logs
    /// (hand-edited history) is kept in the music bucket only.
    pub async fn load(music_path: impl Into<PathBuf>, non_music_path: impl Into<PathBuf>) -> Result<Self> {
        let music_path = music_path.into();
        let non_music_path = non_music_path.into();

        let (music, music_stats) = read_log(&music_path).await?;
        let (mut non_music, non_music_stats) = read_log(&non_music_path).await?;

        let overlap: Vec<CanonicalUrl> = non_music.intersection(&music).cloned().collect();
        for url in &overlap {
            warn!(url = %url, "URL present in both logs, keeping music classification");
            non_music.remove(url);
        }

        info!(
            "Loaded {} music links from {} ({} skipped)",
            music_stats.loaded,
            music_path.display(),
            music_stats.skipped
        );
        info!(
            "Loaded {} non-music links from {} ({} skipped)",
            non_music_stats.loaded,
            non_music_path.display(),
            non_music_stats.skipped
        );

        Ok(Self {
            index: RwLock::new(Index { music, non_music }),
            music_path,
            non_music_path,
        })
    }

    /// True iff the URL is in either bucket
    pub async fn contains(&self, url: &CanonicalUrl) -> bool {
        self.index.read().await.bucket_of(url).is_some()
    }

    /// Which bucket holds the URL, if any
    pub async fn bucket_of(&self, url: &CanonicalUrl) -> Option<Bucket> {
        self.index.read().await.bucket_of(url)
    }

    /// Append a classification record and index it
    ///
    /// Returns `Ok(false)` without writing if the URL is already recorded in
    /// either bucket. The write lock is held across the append so a URL can
    /// never land in both logs.
    pub async fn record(&self, url: &CanonicalUrl, title: &str, bucket: Bucket) -> Result<bool> {
        let mut index = self.index.write().await;
        if let Some(existing) = index.bucket_of(url) {
            warn!(url = %url, bucket = %existing, "Refusing to record URL twice");
            return Ok(false);
        }

        let path = self.path_for(bucket);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;

        let mut line = String::new();
        if !ends_with_newline(&mut file).await? {
            warn!("{} ends with an unterminated line, terminating it", path.display());
            line.push('\n');
        }
        line.push_str(&format!("{}{}{}\n", url, SEPARATOR, sanitize_title(title)));
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        match bucket {
            Bucket::Music => index.music.insert(url.clone()),
            Bucket::NonMusic => index.non_music.insert(url.clone()),
        };
        Ok(true)
    }

    /// Number of (music, non-music) entries
    pub async fn counts(&self) -> (usize, usize) {
        let index = self.index.read().await;
        (index.music.len(), index.non_music.len())
    }

    /// Log file for a bucket
    pub fn path_for(&self, bucket: Bucket) -> &Path {
        match bucket {
            Bucket::Music => &self.music_path,
            Bucket::NonMusic => &self.non_music_path,
        }
    }
}

/// True for an empty file or one whose last byte is a newline
async fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

/// One record is always one line
fn sanitize_title(title: &str) -> String {
    title.replace(['\r', '\n'], " ")
}

async fn read_log(path: &Path) -> Result<(HashSet<CanonicalUrl>, LoadStats)> {
    let mut urls = HashSet::new();
    let mut stats = LoadStats::default();

    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((urls, stats)),
        Err(e) => return Err(e.into()),
    };

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let url_part = match line.split_once(SEPARATOR.trim()) {
            Some((url, _title)) => url.trim(),
            None => line,
        };
        match CanonicalUrl::from_canonical(url_part) {
            Some(url) => {
                urls.insert(url);
                stats.loaded += 1;
            }
            None => {
                warn!(
                    "Skipping malformed line {} in {}: {:?}",
                    line_no + 1,
                    path.display(),
                    line
                );
                stats.skipped += 1;
            }
        }
    }

    Ok((urls, stats))
}

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Download state of a whole video (one row in the downloads listing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStatus {
    pub video_id: String,
    pub done: bool,
    /// Unix milliseconds of the last write.
    pub timestamp: i64,
}

impl VideoStatus {
    pub fn new(video_id: impl Into<String>, done: bool) -> Self {
        Self {
            video_id: video_id.into(),
            done,
            timestamp: now_millis(),
        }
    }
}

/// A logical resource of a video plus the URL it is actually fetched from.
///
/// `url` is the key playback uses to read the file back; `download_url` may
/// differ (signed URLs, CDN hosts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub url: String,
    pub download_url: String,
}

impl FileSource {
    pub fn new(url: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            download_url: download_url.into(),
        }
    }

    /// Source whose logical and fetch URLs are the same.
    pub fn direct(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            download_url: url.clone(),
            url,
        }
    }
}

/// Per-file download progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub url: String,
    pub video_id: String,
    pub download_url: String,
    pub mime_type: Option<String>,
    pub bytes_downloaded: u64,
    /// Unknown until a response carries `Content-Length` or `Content-Range`.
    pub bytes_total: Option<u64>,
    pub done: bool,
}

impl FileMeta {
    pub fn new(video_id: impl Into<String>, source: &FileSource) -> Self {
        Self {
            url: source.url.clone(),
            video_id: video_id.into(),
            download_url: source.download_url.clone(),
            mime_type: None,
            bytes_downloaded: 0,
            bytes_total: None,
            done: false,
        }
    }

    /// Fraction of the file committed, in `0.0..=1.0`. A file without a
    /// known total counts as 0 until it is done.
    pub fn fraction(&self) -> f64 {
        if self.done {
            return 1.0;
        }
        match self.bytes_total {
            Some(total) if total > 0 => (self.bytes_downloaded as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// A stored slice of a file. `range_end` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub url: String,
    pub range_start: u64,
    pub range_end: u64,
    pub data: Bytes,
}

impl Chunk {
    /// Chunk holding `data` at `offset`. Empty data yields an empty chunk
    /// (`is_empty()`), which the store never persists.
    pub fn at(url: impl Into<String>, offset: u64, data: Bytes) -> Self {
        let len = data.len() as u64;
        Self {
            url: url.into(),
            range_start: offset,
            range_end: (offset + len).saturating_sub(1),
            data,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Location of a stored chunk without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: i64,
    pub range_start: u64,
    pub range_end: u64,
}

/// Aggregate progress of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0..=100
    pub percent: f64,
    pub bytes_downloaded: u64,
    /// Sum of known totals; `None` while any file's total is unknown.
    pub bytes_total: Option<u64>,
}

impl Progress {
    pub fn empty() -> Self {
        Self {
            percent: 0.0,
            bytes_downloaded: 0,
            bytes_total: None,
        }
    }

    /// Mean of the per-file fractions.
    pub fn of_files(files: &[FileMeta]) -> Self {
        if files.is_empty() {
            return Self::empty();
        }
        let fraction: f64 = files.iter().map(FileMeta::fraction).sum::<f64>() / files.len() as f64;
        let bytes_downloaded = files.iter().map(|f| f.bytes_downloaded).sum();
        let bytes_total = files
            .iter()
            .map(|f| f.bytes_total)
            .sum::<Option<u64>>();
        Self {
            percent: fraction * 100.0,
            bytes_downloaded,
            bytes_total,
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

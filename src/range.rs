//! Range reconstruction
//!
//! Serves HTTP-Range style reads of a fully downloaded file out of its
//! stored chunks. Chunk payloads are pulled from the store one at a time as
//! the body stream is polled, so memory stays bounded by one chunk.

use std::sync::Arc;
use std::vec::IntoIter;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use regex::Regex;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fetch::BodyStream;
use crate::models::ChunkRef;
use crate::store::ChunkStore;

/// Requested byte range, both ends inclusive and optional.
///
/// A missing `start` means 0; a missing `end` means the last byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// Parse a `Range` header value such as `bytes=100-199` or `bytes=100-`.
    /// Multi-range requests are not supported.
    pub fn parse_header(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidRange(format!("unsupported Range header {:?}", value));
        let re = Regex::new(r"^\s*bytes\s*=\s*(\d*)\s*-\s*(\d*)\s*$").map_err(|_| invalid())?;
        let caps = re.captures(value).ok_or_else(invalid)?;

        let bound = |i: usize| -> Result<Option<u64>> {
            match caps.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                Some(s) => s.parse::<u64>().map(Some).map_err(|_| invalid()),
                None => Ok(None),
            }
        };
        let range = Self {
            start: bound(1)?,
            end: bound(2)?,
        };
        if range.start.is_none() && range.end.is_none() {
            return Err(invalid());
        }
        Ok(range)
    }

    /// Inclusive `(first, last)` byte positions within a file of `total`
    /// bytes. Ranges that leave `[0, total)` or are inverted are rejected.
    pub fn resolve(&self, total: u64) -> Result<(u64, u64)> {
        if total == 0 {
            return Err(Error::InvalidRange("file is empty".to_string()));
        }
        let start = self.start.unwrap_or(0);
        let end = self.end.unwrap_or(total - 1);
        if start > end || end >= total {
            return Err(Error::InvalidRange(format!(
                "bytes {}-{} outside 0-{}",
                start,
                end,
                total - 1
            )));
        }
        Ok((start, end))
    }
}

/// Status, headers and body of a range read.
pub struct RangeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Total size of the file.
    pub total: u64,
    pub body: BodyStream,
}

impl RangeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drain the body into memory.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(piece) = self.body.next().await {
            out.extend_from_slice(&piece?);
        }
        Ok(out)
    }
}

/// Reads stored files back with range semantics.
#[derive(Clone)]
pub struct RangeReconstructor {
    store: Arc<Mutex<ChunkStore>>,
}

impl RangeReconstructor {
    pub fn new(store: Arc<Mutex<ChunkStore>>) -> Self {
        Self { store }
    }

    /// Read `url`, optionally restricted to `range`.
    ///
    /// - no range: 200 with `Content-Length` of the whole file
    /// - range: 206 with `Content-Range`, `Accept-Ranges` and `Content-Length`
    pub async fn read(&self, url: &str, range: Option<ByteRange>) -> Result<RangeResponse> {
        let (file, span, refs) = {
            let store = self.store.lock().await;
            let file = store
                .get_file(url)?
                .ok_or_else(|| Error::NotFound(url.to_string()))?;
            if !file.done {
                return Err(Error::NotDownloaded(url.to_string()));
            }

            let total = file.bytes_total.unwrap_or(file.bytes_downloaded);
            let span = match range {
                Some(r) => Some(r.resolve(total)?),
                None if total == 0 => None,
                None => Some((0, total - 1)),
            };
            let refs = match span {
                Some((start, end)) => store.chunk_refs(url, start, end)?,
                None => Vec::new(),
            };
            (file, span, refs)
        };
        let total = file.bytes_total.unwrap_or(file.bytes_downloaded);

        if let Some((start, end)) = span {
            check_coverage(url, &refs, start, end)?;
        }

        let length = span.map(|(s, e)| e - s + 1).unwrap_or(0);
        let mut headers = vec![("Content-Length".to_string(), length.to_string())];
        let status = match (range, span) {
            (Some(_), Some((start, end))) => {
                headers.push((
                    "Content-Range".to_string(),
                    format!("bytes {}-{}/{}", start, end, total),
                ));
                headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
                206
            }
            _ => 200,
        };
        if let Some(mime_type) = &file.mime_type {
            headers.push(("Content-Type".to_string(), mime_type.clone()));
        }

        log::debug!(
            "Range read {} {:?} -> {} ({} chunks)",
            url,
            span,
            status,
            refs.len()
        );

        let body = match span {
            Some((start, end)) => chunk_stream(self.store.clone(), refs, start, end),
            None => Box::pin(stream::empty()),
        };
        Ok(RangeResponse {
            status,
            headers,
            total,
            body,
        })
    }
}

/// Refuse to serve a range the stored chunks do not fully cover.
fn check_coverage(url: &str, refs: &[ChunkRef], start: u64, end: u64) -> Result<()> {
    let mut next = start;
    for r in refs {
        if r.range_start > next {
            break;
        }
        next = next.max(r.range_end + 1);
    }
    if next <= end {
        return Err(Error::NotDownloaded(format!(
            "{}: stored chunks stop at byte {} of requested {}-{}",
            url, next, start, end
        )));
    }
    Ok(())
}

struct ChunkCursor {
    store: Arc<Mutex<ChunkStore>>,
    refs: IntoIter<ChunkRef>,
    start: u64,
    end: u64,
    failed: bool,
}

fn chunk_stream(
    store: Arc<Mutex<ChunkStore>>,
    refs: Vec<ChunkRef>,
    start: u64,
    end: u64,
) -> BodyStream {
    let cursor = ChunkCursor {
        store,
        refs: refs.into_iter(),
        start,
        end,
        failed: false,
    };
    Box::pin(stream::unfold(cursor, |mut cursor| async move {
        if cursor.failed {
            return None;
        }
        let r = cursor.refs.next()?;
        let data = {
            let store = cursor.store.lock().await;
            store.chunk_data(r.id)
        };
        let item = match data {
            Ok(Some(data)) => Ok(slice_chunk(&r, data, cursor.start, cursor.end)),
            Ok(None) => Err(Error::NotFound(format!(
                "chunk {}-{} removed during read",
                r.range_start, r.range_end
            ))),
            Err(e) => Err(e),
        };
        cursor.failed = item.is_err();
        Some((item, cursor))
    }))
}

/// The part of a chunk inside `[start, end]`.
fn slice_chunk(r: &ChunkRef, data: Bytes, start: u64, end: u64) -> Bytes {
    let lo = start.saturating_sub(r.range_start) as usize;
    let hi = (end.min(r.range_end) - r.range_start + 1) as usize;
    let hi = hi.min(data.len());
    if lo >= hi {
        return Bytes::new();
    }
    data.slice(lo..hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, FileMeta, VideoStatus};

    fn source_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    /// Stores `data` under `url` in chunks of `chunk` bytes.
    fn stored(data: &[u8], chunk: usize, done: bool) -> RangeReconstructor {
        let mut store = ChunkStore::open_in_memory().unwrap();
        let mut offset = 0u64;
        for part in data.chunks(chunk) {
            offset += part.len() as u64;
            let meta = FileMeta {
                url: "v.mp4".to_string(),
                video_id: "v1".to_string(),
                download_url: "https://cdn/v.mp4".to_string(),
                mime_type: Some("video/mp4".to_string()),
                bytes_downloaded: offset,
                bytes_total: Some(data.len() as u64),
                done: done && offset == data.len() as u64,
            };
            let c = Chunk::at("v.mp4", offset - part.len() as u64, Bytes::copy_from_slice(part));
            store
                .commit(&VideoStatus::new("v1", meta.done), &c, &meta)
                .unwrap();
        }
        RangeReconstructor::new(Arc::new(Mutex::new(store)))
    }

    #[test]
    fn test_parse_range_header() {
        assert_eq!(ByteRange::parse_header("bytes=100-199").unwrap(), ByteRange::new(100, 199));
        assert_eq!(ByteRange::parse_header("bytes=100-").unwrap(), ByteRange::starting_at(100));
        assert_eq!(
            ByteRange::parse_header("bytes=-50").unwrap(),
            ByteRange {
                start: None,
                end: Some(50)
            }
        );
        assert!(ByteRange::parse_header("bytes=-").is_err());
        assert!(ByteRange::parse_header("bytes=0-1,5-6").is_err());
        assert!(ByteRange::parse_header("items=0-1").is_err());
    }

    #[test]
    fn test_resolve_defaults_and_bounds() {
        assert_eq!(ByteRange::default().resolve(10).unwrap(), (0, 9));
        assert_eq!(ByteRange::starting_at(4).resolve(10).unwrap(), (4, 9));
        assert!(ByteRange::new(5, 10).resolve(10).is_err());
        assert!(ByteRange::new(6, 5).resolve(10).is_err());
        assert!(ByteRange::starting_at(0).resolve(0).is_err());
    }

    #[tokio::test]
    async fn test_full_read_is_200() {
        let data = source_bytes(1000);
        let reader = stored(&data, 128, true);
        let resp = reader.read("v.mp4", None).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-length"), Some("1000"));
        assert_eq!(resp.header("Content-Type"), Some("video/mp4"));
        assert!(resp.header("Content-Range").is_none());
        assert_eq!(resp.collect().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_sub_ranges_match_source() {
        let data = source_bytes(1000);
        let reader = stored(&data, 128, true);
        for (a, b) in [(0, 0), (0, 127), (127, 128), (100, 900), (999, 999), (256, 383)] {
            let resp = reader.read("v.mp4", Some(ByteRange::new(a, b))).await.unwrap();
            assert_eq!(resp.status, 206);
            assert_eq!(
                resp.header("Content-Range").map(str::to_string),
                Some(format!("bytes {a}-{b}/1000"))
            );
            assert_eq!(resp.header("Accept-Ranges"), Some("bytes"));
            let body = resp.collect().await.unwrap();
            assert_eq!(body, &data[a as usize..=b as usize]);
        }
    }

    #[tokio::test]
    async fn test_open_ended_range() {
        let data = source_bytes(300);
        let reader = stored(&data, 100, true);
        let resp = reader.read("v.mp4", Some(ByteRange::starting_at(250))).await.unwrap();
        assert_eq!(resp.header("Content-Length"), Some("50"));
        assert_eq!(resp.collect().await.unwrap(), &data[250..]);
    }

    #[tokio::test]
    async fn test_rejects_out_of_bounds_and_unfinished() {
        let data = source_bytes(300);
        let reader = stored(&data, 100, true);
        assert!(matches!(
            reader.read("v.mp4", Some(ByteRange::new(100, 300))).await,
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            reader.read("other.mp4", None).await,
            Err(Error::NotFound(_))
        ));

        let partial = stored(&data, 100, false);
        assert!(matches!(
            partial.read("v.mp4", None).await,
            Err(Error::NotDownloaded(_))
        ));
    }

    #[test]
    fn test_coverage_gap_detected() {
        let refs = vec![
            ChunkRef { id: 1, range_start: 0, range_end: 9 },
            ChunkRef { id: 3, range_start: 20, range_end: 29 },
        ];
        assert!(check_coverage("u", &refs, 0, 9).is_ok());
        assert!(check_coverage("u", &refs, 5, 25).is_err());
    }
}

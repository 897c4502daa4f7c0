//! Downloader
//!
//! Drives one video's remaining files to completion, strictly one file at a
//! time. Progress is resumable from each file's committed `bytes_downloaded`.
//! Pause and cancel are cooperative: the flags are looked at after every body
//! read, never in the middle of a read or a commit. A stop commits whatever
//! the buffer holds first, so a resume starts exactly where the body left off.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;

use crate::buffer::{ChunkBuffer, Flush, FlushOptions};
use crate::error::{Error, Result};
use crate::fetch::HttpFetch;
use crate::mime;
use crate::models::{Chunk, FileMeta};

/// Shared pause/cancel token for one video's pipeline.
#[derive(Debug, Clone, Default)]
pub struct DownloadControl {
    inner: Arc<ControlFlags>,
}

#[derive(Debug, Default)]
struct ControlFlags {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Clear a pause so the same downloader can `run()` again.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Permanent: there is no way back from a cancel.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn should_stop(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }
}

/// One buffer flush, ready to be persisted.
#[derive(Debug, Clone)]
pub struct FlushEvent {
    /// File meta as it will be once this chunk is committed.
    pub file: FileMeta,
    pub chunk: Chunk,
    /// True when this flush completes the last unfinished file.
    pub video_done: bool,
}

/// Receives flushes in order. The downloader only advances its bookkeeping
/// after `on_flush` returns `Ok`.
pub trait FlushListener: Send {
    fn on_flush(&mut self, event: FlushEvent) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
    Cancelled,
}

enum FileOutcome {
    Finished,
    Stopped,
}

pub struct Downloader<C, L> {
    video_id: String,
    files: Vec<FileMeta>,
    current: Option<usize>,
    buffer: ChunkBuffer,
    client: Arc<C>,
    listener: L,
    control: DownloadControl,
}

impl<C, L> Downloader<C, L>
where
    C: HttpFetch,
    L: FlushListener,
{
    pub fn new(
        video_id: impl Into<String>,
        files: Vec<FileMeta>,
        chunk_size: usize,
        client: Arc<C>,
        listener: L,
        control: DownloadControl,
    ) -> Self {
        let current = files.iter().position(|f| !f.done);
        Self {
            video_id: video_id.into(),
            files,
            current,
            buffer: ChunkBuffer::new(chunk_size),
            client,
            listener,
            control,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn files(&self) -> &[FileMeta] {
        &self.files
    }

    pub fn current_file(&self) -> Option<&FileMeta> {
        self.current.map(|idx| &self.files[idx])
    }

    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }

    pub fn control(&self) -> &DownloadControl {
        &self.control
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Download remaining files in order until all are done, or the
    /// pipeline is paused or cancelled.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        while let Some(idx) = self.current {
            if let Some(outcome) = self.stop_outcome() {
                return Ok(outcome);
            }
            match self.download_file(idx).await? {
                FileOutcome::Finished => {}
                FileOutcome::Stopped => {
                    return Ok(self.stop_outcome().unwrap_or(RunOutcome::Paused));
                }
            }
        }
        log::info!("Video {} fully downloaded", self.video_id);
        Ok(RunOutcome::Completed)
    }

    fn stop_outcome(&self) -> Option<RunOutcome> {
        if self.control.is_cancelled() {
            Some(RunOutcome::Cancelled)
        } else if self.control.is_paused() {
            Some(RunOutcome::Paused)
        } else {
            None
        }
    }

    async fn download_file(&mut self, idx: usize) -> Result<FileOutcome> {
        self.buffer.reset();

        let (url, download_url, offset, total) = {
            let f = &self.files[idx];
            (f.url.clone(), f.download_url.clone(), f.bytes_downloaded, f.bytes_total)
        };

        // Everything is stored but the terminal flush never committed.
        if offset > 0 && total == Some(offset) {
            log::info!("{} already has all {} bytes, finalizing", url, offset);
            let flush = self.buffer.flush(FlushOptions { done: true });
            self.handle_flush(idx, flush).await?;
            return Ok(FileOutcome::Finished);
        }

        let range_start = (offset > 0).then_some(offset);
        log::info!(
            "Downloading {} for video {} from byte {}",
            url,
            self.video_id,
            offset
        );
        let response = self.client.fetch(&download_url, range_start).await?;

        // With an unknown total the offset can sit at the end of the body.
        if response.is_range_not_satisfiable() {
            return match response.unsatisfied_total() {
                Some(len) if len == offset => {
                    log::info!("{} ends at resume offset {}, finalizing", url, offset);
                    let flush = self.buffer.flush(FlushOptions { done: true });
                    self.handle_flush(idx, flush).await?;
                    Ok(FileOutcome::Finished)
                }
                len => Err(Error::Network(format!(
                    "range bytes={}- of {} not satisfiable (length {:?})",
                    offset, url, len
                ))),
            };
        }

        let body_start = response.body_start(offset);
        if body_start > offset {
            return Err(Error::Network(format!(
                "server resumed {} at byte {}, expected {}",
                url, body_start, offset
            )));
        }
        let mut skip = offset - body_start;
        if skip > 0 {
            log::warn!(
                "Server ignored Range for {}, discarding first {} bytes",
                url,
                skip
            );
        }

        {
            let f = &mut self.files[idx];
            if let Some(total) = response.total_length(offset) {
                f.bytes_total = Some(total);
            }
            if let Some(mime_type) = response.mime_type() {
                f.mime_type = Some(mime_type);
            } else if f.mime_type.is_none() {
                f.mime_type = mime::guess_from_url(&f.url)
                    .or_else(|| mime::guess_from_url(&f.download_url))
                    .map(str::to_string);
            }
        }

        let mut body = response.body;
        while let Some(piece) = body.next().await {
            let mut piece = piece?;
            if skip > 0 {
                let n = skip.min(piece.len() as u64) as usize;
                piece = piece.slice(n..);
                skip -= n as u64;
            }

            for flush in self.buffer.add(&piece) {
                self.handle_flush(idx, flush).await?;
            }
            if self.control.should_stop() {
                // On cancel the listener drops this write.
                if !self.buffer.is_empty() {
                    let flush = self.buffer.flush(FlushOptions { done: false });
                    self.handle_flush(idx, flush).await?;
                }
                log::info!(
                    "Download of {} stopped at byte {}",
                    url,
                    self.files[idx].bytes_downloaded
                );
                return Ok(FileOutcome::Stopped);
            }
        }

        if skip > 0 {
            return Err(Error::Network(format!(
                "body of {} ended before resume offset {}",
                url, offset
            )));
        }

        let flush = self.buffer.flush(FlushOptions { done: true });
        self.handle_flush(idx, flush).await?;
        Ok(FileOutcome::Finished)
    }

    async fn handle_flush(&mut self, idx: usize, flush: Flush) -> Result<()> {
        let mut file = self.files[idx].clone();
        let chunk = Chunk::at(file.url.clone(), file.bytes_downloaded, flush.data);
        file.bytes_downloaded += chunk.len();

        if flush.options.done {
            if let Some(expected) = file.bytes_total.filter(|t| *t != file.bytes_downloaded) {
                log::warn!(
                    "{} ended at {} bytes, server announced {}",
                    file.url,
                    file.bytes_downloaded,
                    expected
                );
            }
            file.bytes_total = Some(file.bytes_downloaded);
            file.done = true;
        }

        let video_done = file.done
            && self
                .files
                .iter()
                .enumerate()
                .all(|(i, f)| i == idx || f.done);

        log::debug!(
            "Flush {} bytes {}-{} (done: {}, video done: {})",
            file.url,
            chunk.range_start,
            chunk.range_end,
            file.done,
            video_done
        );

        self.listener
            .on_flush(FlushEvent {
                file: file.clone(),
                chunk,
                video_done,
            })
            .await?;

        let finished = file.done;
        self.files[idx] = file;
        if finished {
            self.current = self.files.iter().position(|f| !f.done);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{BodyStream, FetchResponse};
    use crate::models::FileSource;
    use bytes::Bytes;
    use futures_util::stream;
    use std::sync::Mutex;

    /// Serves one in-memory body per URL, honoring `Range`.
    struct FakeFetch {
        bodies: Vec<(String, Vec<u8>)>,
        piece: usize,
        /// Leave out `Content-Length` and send `bytes s-e/*`.
        hide_length: bool,
        requests: Mutex<Vec<(String, Option<u64>)>>,
    }

    impl FakeFetch {
        fn new(bodies: Vec<(&str, Vec<u8>)>, piece: usize) -> Self {
            Self {
                bodies: bodies
                    .into_iter()
                    .map(|(u, b)| (u.to_string(), b))
                    .collect(),
                piece,
                hide_length: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn without_length(mut self) -> Self {
            self.hide_length = true;
            self
        }
    }

    impl HttpFetch for FakeFetch {
        async fn fetch(&self, url: &str, range_start: Option<u64>) -> Result<FetchResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), range_start));
            let body = self
                .bodies
                .iter()
                .find(|(u, _)| u == url)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| Error::Network(format!("404 {url}")))?;
            let start = range_start.unwrap_or(0) as usize;
            let total = body.len() as u64;
            if range_start.is_some() && start as u64 >= total {
                return Ok(FetchResponse {
                    status: 416,
                    content_length: None,
                    content_range: Some(format!("bytes */{}", total)),
                    content_type: None,
                    body: Box::pin(stream::empty()),
                });
            }
            let pieces: Vec<Result<Bytes>> = body[start..]
                .chunks(self.piece)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let stream: BodyStream = Box::pin(stream::iter(pieces));
            let announced = if self.hide_length {
                "*".to_string()
            } else {
                total.to_string()
            };
            Ok(FetchResponse {
                status: if range_start.is_some() { 206 } else { 200 },
                content_length: (!self.hide_length).then_some(total - start as u64),
                content_range: range_start
                    .map(|s| format!("bytes {}-{}/{}", s, total - 1, announced)),
                content_type: None,
                body: stream,
            })
        }
    }

    /// Records flushes; optionally pauses once a byte offset is reached.
    #[derive(Default)]
    struct Recorder {
        events: Vec<FlushEvent>,
        pause_at: Option<(u64, DownloadControl)>,
        fail_next: bool,
    }

    impl FlushListener for Recorder {
        async fn on_flush(&mut self, event: FlushEvent) -> Result<()> {
            if self.fail_next {
                self.fail_next = false;
                return Err(Error::QuotaExceeded);
            }
            if let Some((at, control)) = &self.pause_at {
                if event.file.bytes_downloaded >= *at {
                    control.pause();
                }
            }
            self.events.push(event);
            Ok(())
        }
    }

    fn metas(video: &str, urls: &[&str]) -> Vec<FileMeta> {
        urls.iter()
            .map(|u| FileMeta::new(video, &FileSource::direct(*u)))
            .collect()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_files_download_sequentially() {
        let client = Arc::new(FakeFetch::new(
            vec![("https://x/a.mp4", data(25)), ("https://x/b.m4a", data(8))],
            3,
        ));
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4", "https://x/b.m4a"]),
            10,
            client.clone(),
            Recorder::default(),
            DownloadControl::new(),
        );

        assert_eq!(dl.run().await.unwrap(), RunOutcome::Completed);
        assert!(dl.is_done());

        let sizes: Vec<(String, u64, bool, bool)> = dl
            .listener()
            .events
            .iter()
            .map(|e| (e.chunk.url.clone(), e.chunk.len(), e.file.done, e.video_done))
            .collect();
        assert_eq!(
            sizes,
            vec![
                ("https://x/a.mp4".to_string(), 10, false, false),
                ("https://x/a.mp4".to_string(), 10, false, false),
                ("https://x/a.mp4".to_string(), 5, true, false),
                ("https://x/b.m4a".to_string(), 8, true, true),
            ]
        );
        assert_eq!(dl.files()[0].mime_type.as_deref(), Some("video/mp4"));
        assert_eq!(dl.files()[1].bytes_total, Some(8));
        assert_eq!(client.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume_uses_range() {
        let body = data(100);
        let client = Arc::new(FakeFetch::new(vec![("https://x/a.mp4", body.clone())], 7));
        let control = DownloadControl::new();
        let recorder = Recorder {
            pause_at: Some((40, control.clone())),
            ..Default::default()
        };
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4"]),
            20,
            client.clone(),
            recorder,
            control.clone(),
        );

        // The pause lands on the read ending at 42; its two buffered bytes
        // are committed before stopping.
        assert_eq!(dl.run().await.unwrap(), RunOutcome::Paused);
        assert_eq!(dl.files()[0].bytes_downloaded, 42);
        let last = dl.listener().events.last().unwrap();
        assert_eq!((last.chunk.range_start, last.chunk.len()), (40, 2));
        assert!(!last.file.done);

        control.resume();
        assert_eq!(dl.run().await.unwrap(), RunOutcome::Completed);

        let requests = client.requests.lock().unwrap().clone();
        assert_eq!(requests[1], ("https://x/a.mp4".to_string(), Some(42)));

        let mut rebuilt = Vec::new();
        let mut next = 0;
        for e in &dl.listener().events {
            assert_eq!(e.chunk.range_start, next);
            next += e.chunk.len();
            rebuilt.extend_from_slice(&e.chunk.data);
        }
        assert_eq!(rebuilt, body);
    }

    #[tokio::test]
    async fn test_cancelled_before_run_writes_nothing() {
        let client = Arc::new(FakeFetch::new(
            vec![("https://x/a.mp4", data(5)), ("https://x/b.mp4", data(5))],
            5,
        ));
        let control = DownloadControl::new();
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4", "https://x/b.mp4"]),
            100,
            client,
            Recorder::default(),
            control.clone(),
        );
        control.cancel();
        assert_eq!(dl.run().await.unwrap(), RunOutcome::Cancelled);
        assert!(dl.listener().events.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_does_not_advance() {
        let client = Arc::new(FakeFetch::new(vec![("https://x/a.mp4", data(30))], 30));
        let recorder = Recorder {
            fail_next: true,
            ..Default::default()
        };
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4"]),
            10,
            client,
            recorder,
            DownloadControl::new(),
        );
        assert!(matches!(dl.run().await, Err(Error::QuotaExceeded)));
        assert_eq!(dl.files()[0].bytes_downloaded, 0);
        assert_eq!(dl.current_file().map(|f| f.url.as_str()), Some("https://x/a.mp4"));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_done_flush() {
        let client = Arc::new(FakeFetch::new(vec![("https://x/a.mp4", data(20))], 4));
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4"]),
            10,
            client,
            Recorder::default(),
            DownloadControl::new(),
        );
        dl.run().await.unwrap();
        let events = &dl.listener().events;
        assert_eq!(events.len(), 3);
        assert!(events[2].chunk.is_empty());
        assert!(events[2].file.done && events[2].video_done);
        assert_eq!(events[2].file.bytes_total, Some(20));
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let client = Arc::new(FakeFetch::new(vec![], 4));
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/missing.mp4"]),
            10,
            client,
            Recorder::default(),
            DownloadControl::new(),
        );
        assert!(matches!(dl.run().await, Err(Error::Network(_))));
        assert!(!dl.is_done());
    }

    #[tokio::test]
    async fn test_resume_at_end_of_unknown_length_body() {
        let client =
            Arc::new(FakeFetch::new(vec![("https://x/a.mp4", data(20))], 5).without_length());
        let control = DownloadControl::new();
        let recorder = Recorder {
            pause_at: Some((20, control.clone())),
            ..Default::default()
        };
        let mut dl = Downloader::new(
            "v1",
            metas("v1", &["https://x/a.mp4"]),
            10,
            client.clone(),
            recorder,
            control.clone(),
        );

        assert_eq!(dl.run().await.unwrap(), RunOutcome::Paused);
        assert_eq!(dl.files()[0].bytes_downloaded, 20);
        assert_eq!(dl.files()[0].bytes_total, None);
        assert!(!dl.files()[0].done);
        assert_eq!(crate::models::Progress::of_files(dl.files()).percent, 0.0);

        control.resume();
        assert_eq!(dl.run().await.unwrap(), RunOutcome::Completed);
        let requests = client.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![
                ("https://x/a.mp4".to_string(), None),
                ("https://x/a.mp4".to_string(), Some(20)),
            ]
        );

        let file = &dl.files()[0];
        assert!(file.done);
        assert_eq!(file.bytes_total, Some(20));
        let last = dl.listener().events.last().unwrap();
        assert!(last.chunk.is_empty() && last.video_done);
        assert_eq!(crate::models::Progress::of_files(dl.files()).percent, 100.0);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_before_end_is_network_error() {
        let client = Arc::new(FakeFetch::new(vec![("https://x/a.mp4", data(20))], 5));
        let mut files = metas("v1", &["https://x/a.mp4"]);
        files[0].bytes_downloaded = 30;
        let mut dl = Downloader::new(
            "v1",
            files,
            10,
            client,
            Recorder::default(),
            DownloadControl::new(),
        );
        assert!(matches!(dl.run().await, Err(Error::Network(_))));
        assert!(dl.listener().events.is_empty());
    }
}

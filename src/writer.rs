use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::downloader::{DownloadControl, FlushEvent, FlushListener};
use crate::error::{Error, Result};
use crate::events::OfflineEvent;
use crate::models::{Chunk, FileMeta, Progress, VideoStatus};
use crate::store::ChunkStore;

/// Commits flushed chunks of one video to the store and reports progress.
///
/// Each commit writes the video status, the chunk and the file meta as a
/// single transaction. Progress events go out only after the commit is
/// durable.
pub struct PersistenceWriter {
    video_id: String,
    store: Arc<Mutex<ChunkStore>>,
    control: DownloadControl,
    files: Vec<FileMeta>,
    event_tx: mpsc::Sender<OfflineEvent>,
}

impl PersistenceWriter {
    /// `files` is the video's file list as last committed; it seeds the
    /// progress computation.
    pub fn new(
        video_id: impl Into<String>,
        store: Arc<Mutex<ChunkStore>>,
        control: DownloadControl,
        files: Vec<FileMeta>,
        event_tx: mpsc::Sender<OfflineEvent>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            store,
            control,
            files,
            event_tx,
        }
    }

    /// Stop accepting commits. Later `commit` calls succeed without writing.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn progress(&self) -> Progress {
        Progress::of_files(&self.files)
    }

    pub async fn commit(&mut self, file: &FileMeta, chunk: &Chunk, video_done: bool) -> Result<()> {
        {
            let mut store = self.store.lock().await;
            // Checked under the lock: a remove that already ran must stay removed.
            if self.control.is_cancelled() {
                log::debug!(
                    "Dropping commit for {} of cancelled video {}",
                    file.url,
                    self.video_id
                );
                return Ok(());
            }

            let status = VideoStatus::new(&self.video_id, video_done);
            match store.commit(&status, chunk, file) {
                Ok(()) => {}
                Err(Error::QuotaExceeded) => {
                    log::error!(
                        "Storage quota exceeded writing {} of video {}, cancelling",
                        file.url,
                        self.video_id
                    );
                    self.control.cancel();
                    return Err(Error::QuotaExceeded);
                }
                Err(e) => return Err(e),
            }
        }

        match self.files.iter_mut().find(|f| f.url == file.url) {
            Some(slot) => *slot = file.clone(),
            None => self.files.push(file.clone()),
        }

        let progress = self.progress();
        log::debug!(
            "Committed {} bytes {}-{} for {} ({:.1}%)",
            file.url,
            chunk.range_start,
            chunk.range_end,
            self.video_id,
            progress.percent
        );
        // A dropped receiver only means nobody is listening.
        let _ = self
            .event_tx
            .send(OfflineEvent::DownloadProgress {
                video_id: self.video_id.clone(),
                progress,
            })
            .await;
        Ok(())
    }
}

impl FlushListener for PersistenceWriter {
    async fn on_flush(&mut self, event: FlushEvent) -> Result<()> {
        self.commit(&event.file, &event.chunk, event.video_done).await
    }
}

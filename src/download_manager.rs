//! Download Manager
//!
//! Owns one background task per downloading video and maps each task's
//! outcome onto lifecycle events (start, pause, cancel, complete, fail).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::DownloadSettings;
use crate::downloader::{DownloadControl, Downloader, RunOutcome};
use crate::error::{Error, Result};
use crate::events::{helpers, OfflineEvent};
use crate::fetch::HttpFetch;
use crate::models::{FileMeta, FileSource};
use crate::store::ChunkStore;
use crate::writer::PersistenceWriter;

struct ActiveDownload {
    generation: u64,
    control: DownloadControl,
    handle: JoinHandle<()>,
}

/// Schedules the per-video download pipelines.
/// Nothing is spawned until a download is started.
pub struct DownloadManager<C> {
    settings: DownloadSettings,
    store: Arc<Mutex<ChunkStore>>,
    client: Arc<C>,
    event_tx: mpsc::Sender<OfflineEvent>,
    active: Arc<RwLock<HashMap<String, ActiveDownload>>>,
    generation: AtomicU64,
}

impl<C> DownloadManager<C>
where
    C: HttpFetch + 'static,
{
    pub fn new(
        settings: DownloadSettings,
        store: Arc<Mutex<ChunkStore>>,
        client: Arc<C>,
        event_tx: mpsc::Sender<OfflineEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            client,
            event_tx,
            active: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start downloading `video_id`, or resume it from what is committed.
    ///
    /// `files` lists the video's resources in download order. Files already
    /// known to the store keep their progress. An empty list resumes the
    /// stored files. A video whose files are all done completes immediately.
    pub async fn start_or_resume(&self, video_id: &str, files: Vec<FileSource>) -> Result<()> {
        if let Some(stale) = self.take_stopping(video_id).await {
            log::debug!("Waiting for previous task of {} to wind down", video_id);
            let _ = stale.handle.await;
        }

        if self.active.read().await.contains_key(video_id) {
            log::warn!("Download {} is already active", video_id);
            return Ok(());
        }

        let metas = self.prepare_files(video_id, files).await?;
        if metas.iter().all(|f| f.done) {
            log::info!("Video {} is already downloaded", video_id);
            self.send(OfflineEvent::DownloadCompleted {
                video_id: video_id.to_string(),
            })
            .await;
            return Ok(());
        }

        let control = DownloadControl::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let writer = PersistenceWriter::new(
            video_id,
            self.store.clone(),
            control.clone(),
            metas.clone(),
            self.event_tx.clone(),
        );
        let mut downloader = Downloader::new(
            video_id,
            metas,
            self.settings.chunk_size,
            self.client.clone(),
            writer,
            control.clone(),
        );

        let mut active = self.active.write().await;
        if active.contains_key(video_id) {
            log::warn!("Download {} was started concurrently", video_id);
            return Ok(());
        }

        log::info!(
            "Starting download of {} ({} files)",
            video_id,
            downloader.files().len()
        );

        let id = video_id.to_string();
        let event_tx = self.event_tx.clone();
        let registry = self.active.clone();
        let handle = tokio::spawn(async move {
            let _ = event_tx
                .send(OfflineEvent::DownloadStarted {
                    video_id: id.clone(),
                })
                .await;
            let result = downloader.run().await;

            {
                let mut registry = registry.write().await;
                if registry.get(&id).map(|a| a.generation) == Some(generation) {
                    registry.remove(&id);
                }
            }

            let event = match result {
                Ok(RunOutcome::Completed) => {
                    log::info!("Download {} completed", id);
                    OfflineEvent::DownloadCompleted { video_id: id }
                }
                Ok(RunOutcome::Paused) => {
                    log::info!("Download {} paused", id);
                    OfflineEvent::DownloadPaused { video_id: id }
                }
                Ok(RunOutcome::Cancelled) => {
                    log::info!("Download {} canceled", id);
                    OfflineEvent::DownloadCanceled { video_id: id }
                }
                Err(e) => {
                    log::error!("Download {} failed: {}", id, e);
                    helpers::failed(id, &e)
                }
            };
            let _ = event_tx.send(event).await;
        });

        active.insert(
            video_id.to_string(),
            ActiveDownload {
                generation,
                control,
                handle,
            },
        );
        Ok(())
    }

    /// Pause a running download at its next flush boundary.
    /// Returns false when the video had no active task.
    pub async fn pause(&self, video_id: &str) -> bool {
        match self.active.read().await.get(video_id) {
            Some(a) => {
                a.control.pause();
                log::info!("Sent pause signal to download {}", video_id);
                true
            }
            None => false,
        }
    }

    /// Cancel a running download. Committed chunks are kept; commits that
    /// arrive after this call are discarded.
    pub async fn cancel(&self, video_id: &str) -> bool {
        match self.active.read().await.get(video_id) {
            Some(a) => {
                a.control.cancel();
                log::info!("Sent cancel signal to download {}", video_id);
                true
            }
            None => false,
        }
    }

    /// Cancel any active download of `video_id`, then delete all its records.
    pub async fn remove_video(&self, video_id: &str) -> Result<()> {
        self.cancel(video_id).await;
        let removed = self.store.lock().await.remove_video(video_id)?;
        if removed.videos == 0 && removed.files == 0 {
            log::debug!("remove_video: nothing stored for {}", video_id);
        }
        Ok(())
    }

    /// Cancel every active download, then empty the store.
    pub async fn clear_all(&self) -> Result<()> {
        for a in self.active.read().await.values() {
            a.control.cancel();
        }
        self.store.lock().await.clear_all()?;
        log::info!("Cleared all offline data");
        Ok(())
    }

    pub async fn is_active(&self, video_id: &str) -> bool {
        self.active.read().await.contains_key(video_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Pause all active downloads and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ActiveDownload)> = self.active.write().await.drain().collect();
        for (_, a) in &drained {
            a.control.pause();
        }
        for (id, a) in drained {
            if let Err(e) = a.handle.await {
                log::warn!("Download task {} ended abnormally: {}", id, e);
            }
        }
    }

    /// Remove the entry of a task that was told to stop but may still be
    /// finishing its current read or commit.
    async fn take_stopping(&self, video_id: &str) -> Option<ActiveDownload> {
        let mut active = self.active.write().await;
        let stopping = active
            .get(video_id)
            .map(|a| a.control.should_stop())
            .unwrap_or(false);
        if stopping {
            active.remove(video_id)
        } else {
            None
        }
    }

    /// Merge the requested sources with what the store already knows.
    async fn prepare_files(
        &self,
        video_id: &str,
        sources: Vec<FileSource>,
    ) -> Result<Vec<FileMeta>> {
        let mut store = self.store.lock().await;
        let stored = store.files_for_video(video_id)?;

        let mut metas = Vec::with_capacity(sources.len().max(stored.len()));
        for source in &sources {
            if metas.iter().any(|m: &FileMeta| m.url == source.url) {
                continue;
            }
            let meta = match store.get_file(&source.url)? {
                Some(mut existing) => {
                    if existing.video_id != video_id {
                        log::warn!(
                            "{} was stored for video {}, reassigning to {}",
                            source.url,
                            existing.video_id,
                            video_id
                        );
                        existing.video_id = video_id.to_string();
                    }
                    existing.download_url = source.download_url.clone();
                    existing
                }
                None => FileMeta::new(video_id, source),
            };
            metas.push(meta);
        }
        for meta in stored {
            if !metas.iter().any(|m| m.url == meta.url) {
                metas.push(meta);
            }
        }

        if metas.is_empty() {
            return Err(Error::NotFound(format!("no files stored for video {}", video_id)));
        }

        for meta in metas.iter().filter(|m| !m.done) {
            let stray = store.delete_chunks_from(&meta.url, meta.bytes_downloaded)?;
            if stray > 0 {
                log::warn!(
                    "Dropped {} uncommitted chunks of {} past byte {}",
                    stray,
                    meta.url,
                    meta.bytes_downloaded
                );
            }
        }
        Ok(metas)
    }

    async fn send(&self, event: OfflineEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

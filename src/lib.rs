//! Offline media store.
//!
//! Downloads the files of a video in fixed-size chunks, persists every chunk
//! with its byte range in SQLite, and reads files back with HTTP Range
//! semantics so a player can stream them without the network.
//!
//! [`OfflineMedia`] is the entry point:
//!
//! ```no_run
//! # async fn demo() -> offline_media::Result<()> {
//! use offline_media::{Config, FileSource, OfflineMedia};
//!
//! let (media, mut events) = OfflineMedia::open(Config::default())?;
//! media
//!     .start_or_resume_download("v1", vec![FileSource::direct("https://cdn.example/v1.mp4")])
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! let body = media.read_range("https://cdn.example/v1.mp4", None).await?.collect().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

pub mod buffer;
pub mod config;
pub mod download_manager;
pub mod downloader;
pub mod error;
pub mod events;
pub mod fetch;
pub mod mime;
pub mod models;
pub mod range;
pub mod store;
pub mod writer;

pub use config::{Config, DownloadSettings, StoreSettings};
pub use download_manager::DownloadManager;
pub use error::{Error, Result};
pub use events::{ErrorCode, OfflineEvent};
pub use fetch::{HttpFetch, ReqwestFetcher};
pub use models::{FileMeta, FileSource, Progress, VideoStatus};
pub use range::{ByteRange, RangeResponse};
pub use store::ChunkStore;

use range::RangeReconstructor;

/// Handle on the offline store and its download pipelines.
pub struct OfflineMedia<C = ReqwestFetcher> {
    store: Arc<Mutex<ChunkStore>>,
    downloads: DownloadManager<C>,
    reader: RangeReconstructor,
}

impl OfflineMedia<ReqwestFetcher> {
    /// Open the store described by `config` and build the HTTP client.
    /// Events of all videos arrive on the returned receiver.
    pub fn open(config: Config) -> Result<(Self, mpsc::Receiver<OfflineEvent>)> {
        config.validate()?;
        let store = ChunkStore::open(&config.store)?;
        let client = ReqwestFetcher::new(config.download.user_agent.clone())?;
        Ok(Self::with_parts(config.download, store, client))
    }
}

impl<C> OfflineMedia<C>
where
    C: HttpFetch + 'static,
{
    /// Assemble from an already opened store and any fetch implementation.
    pub fn with_parts(
        settings: DownloadSettings,
        store: ChunkStore,
        client: C,
    ) -> (Self, mpsc::Receiver<OfflineEvent>) {
        let (event_tx, event_rx) = mpsc::channel(settings.event_buffer.max(1));
        let store = Arc::new(Mutex::new(store));
        let downloads = DownloadManager::new(settings, store.clone(), Arc::new(client), event_tx);
        let reader = RangeReconstructor::new(store.clone());
        (
            Self {
                store,
                downloads,
                reader,
            },
            event_rx,
        )
    }

    /// Shared store handle, for inspection and maintenance.
    pub fn store(&self) -> &Arc<Mutex<ChunkStore>> {
        &self.store
    }

    pub async fn start_or_resume_download(
        &self,
        video_id: &str,
        files: Vec<FileSource>,
    ) -> Result<()> {
        self.downloads.start_or_resume(video_id, files).await
    }

    pub async fn pause(&self, video_id: &str) -> bool {
        self.downloads.pause(video_id).await
    }

    pub async fn cancel(&self, video_id: &str) -> bool {
        self.downloads.cancel(video_id).await
    }

    pub async fn read_range(&self, url: &str, range: Option<ByteRange>) -> Result<RangeResponse> {
        self.reader.read(url, range).await
    }

    pub async fn remove_video(&self, video_id: &str) -> Result<()> {
        self.downloads.remove_video(video_id).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.downloads.clear_all().await
    }

    /// Videos with stored data, most recently written first.
    pub async fn list_downloads(&self) -> Result<Vec<VideoStatus>> {
        self.store.lock().await.list_videos()
    }

    pub async fn video_files(&self, video_id: &str) -> Result<Vec<FileMeta>> {
        self.store.lock().await.files_for_video(video_id)
    }

    /// Progress as last committed, or `None` for an unknown video.
    pub async fn video_progress(&self, video_id: &str) -> Result<Option<Progress>> {
        let files = self.video_files(video_id).await?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(Progress::of_files(&files)))
    }

    pub async fn stored_bytes(&self, video_id: &str) -> Result<u64> {
        self.store.lock().await.stored_bytes(video_id)
    }

    pub async fn is_active(&self, video_id: &str) -> bool {
        self.downloads.is_active(video_id).await
    }

    /// Pause every download and wait for the tasks to stop.
    pub async fn shutdown(&self) {
        self.downloads.shutdown().await;
    }

    /// Shut down and close the database connection.
    pub async fn close(self) -> Result<()> {
        let Self {
            store,
            downloads,
            reader,
        } = self;
        downloads.shutdown().await;
        drop(downloads);
        drop(reader);

        match Arc::try_unwrap(store) {
            Ok(store) => store.into_inner().close(),
            Err(_) => {
                log::warn!("Store still referenced by an open read, closing on drop");
                Ok(())
            }
        }
    }
}

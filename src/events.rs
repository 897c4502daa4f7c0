use serde::Serialize;

use crate::models::Progress;

/// Stable error codes so collaborators can map failures to UX
/// (e.g. prompting for cleanup on `QuotaExceeded`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    Network,
    QuotaExceeded,
    StoreUnavailable,
    InvalidRange,
    NotFound,
}

/// Pipeline -> collaborator notifications, keyed by video id.
///
/// Progress and completion are only sent once the corresponding commit is
/// durable in the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OfflineEvent {
    DownloadStarted {
        video_id: String,
    },
    DownloadProgress {
        video_id: String,
        progress: Progress,
    },
    DownloadPaused {
        video_id: String,
    },
    DownloadCanceled {
        video_id: String,
    },
    DownloadCompleted {
        video_id: String,
    },
    DownloadFailed {
        video_id: String,
        error_code: ErrorCode,
        message: String,
    },
}

impl OfflineEvent {
    pub fn video_id(&self) -> &str {
        match self {
            OfflineEvent::DownloadStarted { video_id }
            | OfflineEvent::DownloadProgress { video_id, .. }
            | OfflineEvent::DownloadPaused { video_id }
            | OfflineEvent::DownloadCanceled { video_id }
            | OfflineEvent::DownloadCompleted { video_id }
            | OfflineEvent::DownloadFailed { video_id, .. } => video_id,
        }
    }

    /// True for events after which the video's task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OfflineEvent::DownloadPaused { .. }
                | OfflineEvent::DownloadCanceled { .. }
                | OfflineEvent::DownloadCompleted { .. }
                | OfflineEvent::DownloadFailed { .. }
        )
    }
}

/// Convenience constructors for failure events.
pub mod helpers {
    use super::*;
    use crate::error::Error;

    pub fn failed(video_id: impl Into<String>, err: &Error) -> OfflineEvent {
        OfflineEvent::DownloadFailed {
            video_id: video_id.into(),
            error_code: err.code(),
            message: user_message(err),
        }
    }

    fn user_message(err: &Error) -> String {
        match err {
            Error::QuotaExceeded => {
                "Storage is full. Remove some downloads and try again.".to_string()
            }
            Error::Network(_) => {
                "Network error occurred. Check your connection and retry.".to_string()
            }
            other => other.to_string(),
        }
    }
}

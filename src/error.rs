use rusqlite::ErrorCode as SqliteCode;
use thiserror::Error;

use crate::events::ErrorCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the offline pipeline surfaces to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Fetch or body read failed. The download stalls and can be resumed
    /// from the last committed offset.
    #[error("network error: {0}")]
    Network(String),

    /// The store ran out of space. The commit was rolled back and the
    /// video's pipeline cancelled.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// The storage engine could not be opened or migrated.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid range request: {0}")]
    InvalidRange(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A read was requested for a file that has not finished downloading.
    #[error("file not fully downloaded: {0}")]
    NotDownloaded(String),

    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Stable code carried by failure events.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Network(_) => ErrorCode::Network,
            Error::QuotaExceeded => ErrorCode::QuotaExceeded,
            Error::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Error::InvalidRange(_) => ErrorCode::InvalidRange,
            Error::NotFound(_) | Error::NotDownloaded(_) => ErrorCode::NotFound,
            Error::Storage(_) | Error::Config(_) => ErrorCode::Unknown,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _) if inner.code == SqliteCode::DiskFull => {
                Error::QuotaExceeded
            }
            _ => Error::Storage(e),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a raw URL was refused by the canonicalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("URL is empty")]
    Empty,
    #[error("URL too long (max {max} characters)")]
    TooLong { max: usize },
    #[error("URL is not valid")]
    Malformed,
    #[error("URL must start with http:// or https://")]
    UnsupportedScheme,
    #[error("Unsupported platform. Supported: YouTube, Facebook, Instagram, X/Twitter")]
    UnsupportedHost,
    #[error("URLs with embedded credentials are not accepted")]
    Credentials,
    #[error("Could not extract valid video ID from {platform} URL")]
    NoContentId { platform: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    UpdateCheckFailed,
    ExtractionFailed,
    FileTooLarge,
    Timeout,
    NotFound,
    ServerBusy,
    Cancelled,
    Internal,
}

/// Errors that may be shown to callers.
///
/// Every message here is already sanitized: no filesystem paths, command
/// lines or raw extractor output. Detail of that kind goes to the log at the
/// point the error is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Extractor update check failed: {0}")]
    UpdateCheckFailed(String),
    #[error("{0}")]
    ExtractionFailed(String),
    #[error("File exceeds the {limit_mb} MB size limit")]
    FileTooLarge { limit_mb: u64 },
    #[error("Download timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
    #[error("File not found or expired")]
    NotFound,
    #[error("Server busy, please try again shortly")]
    ServerBusy,
    #[error("Download cancelled")]
    Cancelled,
    #[error("Internal server error")]
    Internal,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::UpdateCheckFailed(_) => ErrorKind::UpdateCheckFailed,
            Self::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Self::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotFound => ErrorKind::NotFound,
            Self::ServerBusy => ErrorKind::ServerBusy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal => ErrorKind::Internal,
        }
    }

    pub fn file_too_large(limit_bytes: u64) -> Self {
        Self::FileTooLarge {
            limit_mb: limit_bytes / (1024 * 1024),
        }
    }
}

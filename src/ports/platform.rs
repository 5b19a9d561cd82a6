use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::models::{Platform, QualityTier, Track};
use crate::services::downloader::error::DownloadError;

/// Everything `fetch` needs, produced by `resolve_stream`. Immutable, and the only
/// state carried from one call to the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamHandle {
    /// A URL the origin handed out that is reachable from here.
    Direct {
        url: Url,
        tier: QualityTier,
        /// File extension reported by the origin
        file_type: String,
    },
    /// Bytes must be pulled through the relay service.
    Relay {
        platform: Platform,
        track_id: String,
        tier: QualityTier,
        session_cookie: String,
    },
}

impl StreamHandle {
    pub fn tier(&self) -> QualityTier {
        match self {
            StreamHandle::Direct { tier, .. } | StreamHandle::Relay { tier, .. } => *tier,
        }
    }
}

/// A file fully written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Tier the origin actually delivered
    pub tier: QualityTier,
}

/// Port trait for one source platform's download path.
///
/// Implementations report only whether the requested tier works; walking the
/// fallback chain is the queue's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PlatformDownloader: Send + Sync {
    fn platform(&self) -> Platform;

    async fn resolve_stream(
        &self,
        track: &Track,
        tier: QualityTier,
        session: &str,
    ) -> Result<StreamHandle, DownloadError>;

    /// Write the stream to `destination` plus an extension chosen from the
    /// response. Partial output is removed on any error, including cancellation.
    async fn fetch(
        &self,
        handle: &StreamHandle,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile, DownloadError>;
}

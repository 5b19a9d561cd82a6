use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;
use crate::models::{QualityTier, Track};
use crate::ports::platform::FetchedFile;

/// Give up on ` (n)` suffixes past this many same-named files.
const MAX_NAME_SUFFIX: u32 = 100;

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Bounds applied to every body transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Longest gap between two chunks before the transfer is abandoned
    pub inactivity_timeout: Duration,
    /// Smaller bodies are stubs or previews, not the requested tier
    pub min_bytes: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(120),
            min_bytes: 10_000,
        }
    }
}

/// Stream a response body into `destination.<extension>`.
///
/// Bytes go to a `.part` sibling first and are renamed into place only once the
/// body is complete, so a visible file is always a whole file. Each transfer has
/// its own part file, and an existing file is never replaced: a taken name gets a
/// ` (2)`, ` (3)`, ... suffix instead.
pub async fn stream_to_file(
    response: reqwest::Response,
    destination: &Path,
    extension: &str,
    tier: QualityTier,
    limits: &TransferLimits,
    cancel: &CancellationToken,
    via_relay: bool,
) -> Result<FetchedFile, DownloadError> {
    let part = part_path(destination);
    let result = write_body(response, &part, limits, cancel, via_relay).await;

    let written = match result {
        Ok(written) => written,
        Err(err) => {
            remove_if_exists(&part).await;
            return Err(err);
        }
    };

    if written < limits.min_bytes {
        tracing::debug!(
            "Discarding {} byte body for tier {}, below {} bytes",
            written,
            tier,
            limits.min_bytes
        );
        remove_if_exists(&part).await;
        return Err(DownloadError::QualityUnavailable(tier));
    }

    let path = match reserve_path(destination, extension).await {
        Ok(path) => path,
        Err(err) => {
            remove_if_exists(&part).await;
            return Err(err);
        }
    };
    if let Err(err) = tokio::fs::rename(&part, &path).await {
        remove_if_exists(&part).await;
        remove_if_exists(&path).await;
        return Err(DownloadError::storage(err));
    }

    Ok(FetchedFile {
        path,
        bytes_written: written,
        tier,
    })
}

async fn write_body(
    response: reqwest::Response,
    part: &Path,
    limits: &TransferLimits,
    cancel: &CancellationToken,
    via_relay: bool,
) -> Result<u64, DownloadError> {
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(DownloadError::storage)?;
    }
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(DownloadError::storage)?;
    let mut body = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = tokio::time::timeout(limits.inactivity_timeout, body.next()) => next,
        };

        match next {
            Err(_) => {
                return Err(DownloadError::TransientNetwork(format!(
                    "no data received for {:?}",
                    limits.inactivity_timeout
                )));
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => return Err(DownloadError::from_transport(&err, via_relay)),
            Ok(Some(Ok(chunk))) => {
                file.write_all(&chunk)
                    .await
                    .map_err(DownloadError::storage)?;
                written += chunk.len() as u64;
            }
        }
    }

    file.flush().await.map_err(DownloadError::storage)?;
    Ok(written)
}

/// A `.part` name no other transfer uses, in this process or another.
fn part_path(destination: &Path) -> PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    append_extension(destination, &format!("{}-{}.part", std::process::id(), seq))
}

/// Claim the first free name among `stem.ext`, `stem (2).ext`, ... by creating
/// it exclusively. The finished body is renamed over the empty placeholder.
async fn reserve_path(destination: &Path, extension: &str) -> Result<PathBuf, DownloadError> {
    for n in 1..=MAX_NAME_SUFFIX {
        let candidate = if n == 1 {
            append_extension(destination, extension)
        } else {
            let mut stem = OsString::from(destination.as_os_str());
            stem.push(format!(" ({})", n));
            append_extension(Path::new(&stem), extension)
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(DownloadError::storage(err)),
        }
    }
    Err(DownloadError::Storage(format!(
        "{} and {} numbered variants already exist",
        append_extension(destination, extension).display(),
        MAX_NAME_SUFFIX - 1
    )))
}

pub(crate) async fn remove_if_exists(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        tracing::warn!("Failed to remove {}: {}", path.display(), err);
    }
}

/// `path` with `.ext` appended. Unlike `Path::with_extension`, dots already in
/// the file name are kept.
pub fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Drop characters that are not allowed in file names on common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Where a track's file goes, without extension: `{artist} - {title}`.
pub fn destination_for(download_dir: &Path, track: &Track) -> PathBuf {
    let stem = if track.artist.trim().is_empty() {
        sanitize_filename(&track.title)
    } else {
        sanitize_filename(&format!("{} - {}", track.artist, track.title))
    };
    download_dir.join(stem)
}

/// Normalize a reported file type into an extension.
pub fn extension_for(file_type: Option<&str>) -> String {
    match file_type.map(|t| t.trim().trim_start_matches('.').to_lowercase()) {
        Some(t) if !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric()) => t,
        _ => "mp3".to_string(),
    }
}

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::models::QualityTier;

/// Why a single resolve or fetch attempt failed.
///
/// None of these escape the queue: each maps to a [`Disposition`] the worker applies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),
    #[error("Rate limited by origin")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Session expired or rejected: {0}")]
    AuthExpired(String),
    #[error("Quality {0} unavailable")]
    QualityUnavailable(QualityTier),
    #[error("Track not found at origin: {0}")]
    PermanentNotFound(String),
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Storage error: {0}")]
    Storage(String),
}

/// What the queue does about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry the same tier after the normal backoff
    Retry,
    /// Retry the same tier after a longer, possibly server-chosen, delay
    Backoff { retry_after: Option<Duration> },
    /// Refresh the credential once, then retry the same tier
    RefreshAuth,
    /// Move on to the next tier of the fallback chain
    Fallback,
    Fail,
    Cancelled,
}

impl DownloadError {
    pub fn disposition(&self) -> Disposition {
        match self {
            DownloadError::TransientNetwork(_) | DownloadError::RelayUnreachable(_) => {
                Disposition::Retry
            }
            DownloadError::RateLimited { retry_after } => Disposition::Backoff {
                retry_after: *retry_after,
            },
            DownloadError::AuthExpired(_) => Disposition::RefreshAuth,
            DownloadError::QualityUnavailable(_) => Disposition::Fallback,
            DownloadError::PermanentNotFound(_) | DownloadError::Storage(_) => Disposition::Fail,
            DownloadError::Cancelled => Disposition::Cancelled,
        }
    }

    /// Classify a transport-level failure. Through the relay, not getting an answer
    /// at all means the relay itself is down.
    pub fn from_transport(err: &reqwest::Error, via_relay: bool) -> Self {
        let message = err.to_string();
        if via_relay && (err.is_connect() || err.is_timeout()) {
            DownloadError::RelayUnreachable(message)
        } else {
            DownloadError::TransientNetwork(message)
        }
    }

    /// Classify a non-success relay status.
    pub fn from_relay_status(status: StatusCode, headers: &HeaderMap, tier: QualityTier) -> Self {
        match status {
            StatusCode::NOT_FOUND => DownloadError::QualityUnavailable(tier),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DownloadError::AuthExpired(format!("relay answered {}", status))
            }
            // Missing session cookie
            StatusCode::BAD_REQUEST => {
                DownloadError::AuthExpired("relay rejected the session cookie".into())
            }
            StatusCode::TOO_MANY_REQUESTS => DownloadError::RateLimited {
                retry_after: retry_after(headers),
            },
            status if status.is_server_error() => {
                DownloadError::TransientNetwork(format!("relay answered {}", status))
            }
            status => DownloadError::PermanentNotFound(format!("relay answered {}", status)),
        }
    }

    pub fn storage(err: std::io::Error) -> Self {
        DownloadError::Storage(err.to_string())
    }
}

/// `Retry-After` in its delta-seconds form.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn test_relay_status_mapping() {
        let headers = HeaderMap::new();
        assert_eq!(
            DownloadError::from_relay_status(StatusCode::NOT_FOUND, &headers, QualityTier::Hires),
            DownloadError::QualityUnavailable(QualityTier::Hires)
        );
        assert_eq!(
            DownloadError::from_relay_status(StatusCode::UNAUTHORIZED, &headers, QualityTier::Hires)
                .disposition(),
            Disposition::RefreshAuth
        );
        assert_eq!(
            DownloadError::from_relay_status(StatusCode::BAD_GATEWAY, &headers, QualityTier::Hires)
                .disposition(),
            Disposition::Retry
        );
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(
            DownloadError::from_relay_status(
                StatusCode::TOO_MANY_REQUESTS,
                &headers,
                QualityTier::Standard
            ),
            DownloadError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn test_relay_unreachable_retries_like_transient() {
        assert_eq!(
            DownloadError::RelayUnreachable("refused".into()).disposition(),
            DownloadError::TransientNetwork("reset".into()).disposition()
        );
        assert_eq!(
            DownloadError::PermanentNotFound("gone".into()).disposition(),
            Disposition::Fail
        );
    }
}

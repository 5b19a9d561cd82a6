use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::{DownloadError, retry_after};
use super::relay::{RelayClient, fetch_via_relay};
use super::transfer::{TransferLimits, extension_for, stream_to_file};
use crate::config::Route;
use crate::models::{Platform, QualityTier, Track};
use crate::ports::platform::{FetchedFile, PlatformDownloader, StreamHandle};

pub const NETEASE_API_BASE: &str = "https://music.163.com/";

#[derive(Debug, Deserialize)]
struct PlayerUrlResponse {
    code: i64,
    #[serde(default)]
    data: Vec<PlayerUrlItem>,
}

#[derive(Debug, Deserialize)]
struct PlayerUrlItem {
    url: Option<String>,
    #[serde(default)]
    br: u32,
    #[serde(rename = "type")]
    file_type: Option<String>,
    #[serde(default)]
    code: i64,
}

/// NetEase Cloud Music. Resolves URLs itself unless routed through the relay.
pub struct NeteaseDownloader {
    client: Client,
    api_base: String,
    route: Route,
    relay: Option<Arc<RelayClient>>,
    limits: TransferLimits,
    resolve_timeout: Duration,
}

impl NeteaseDownloader {
    pub fn new(
        client: Client,
        route: Route,
        relay: Option<Arc<RelayClient>>,
        limits: TransferLimits,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: NETEASE_API_BASE.to_string(),
            route,
            relay,
            limits,
            resolve_timeout,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = format!("{}/", api_base.trim_end_matches('/'));
        self
    }

    fn relay(&self) -> Result<&RelayClient, DownloadError> {
        self.relay.as_deref().ok_or_else(|| {
            DownloadError::RelayUnreachable("netease is routed through an unconfigured relay".into())
        })
    }

    async fn resolve_direct(
        &self,
        track: &Track,
        tier: QualityTier,
        session: &str,
    ) -> Result<StreamHandle, DownloadError> {
        let url = Url::parse(&format!("{}api/song/enhance/player/url", self.api_base))
            .map_err(|err| DownloadError::TransientNetwork(format!("bad api base: {}", err)))?;
        let ids = format!("[{}]", track.id);
        let bitrate = tier.bitrate().to_string();

        let response = self
            .client
            .get(url)
            .query(&[("ids", ids.as_str()), ("br", bitrate.as_str())])
            .header(reqwest::header::COOKIE, session)
            .timeout(self.resolve_timeout)
            .send()
            .await
            .map_err(|err| DownloadError::from_transport(&err, false))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(DownloadError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if !response.status().is_success() {
            return Err(DownloadError::TransientNetwork(format!(
                "player url answered {}",
                response.status()
            )));
        }

        let body: PlayerUrlResponse = response
            .json()
            .await
            .map_err(|err| DownloadError::TransientNetwork(format!("bad player url body: {}", err)))?;
        classify_player_url(body, &track.id, tier)
    }

    async fn fetch_direct(
        &self,
        url: &Url,
        tier: QualityTier,
        file_type: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile, DownloadError> {
        let request = self.client.get(url.clone()).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = tokio::time::timeout(self.resolve_timeout, request) => response,
        };
        let response = match response {
            Err(_) => {
                return Err(DownloadError::TransientNetwork(
                    "no response from media server".into(),
                ));
            }
            Ok(Err(err)) => return Err(DownloadError::from_transport(&err, false)),
            Ok(Ok(response)) => response,
        };

        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(DownloadError::RateLimited {
                    retry_after: retry_after(response.headers()),
                });
            }
            // Signed media URLs expire; the next attempt resolves a fresh one
            status => {
                return Err(DownloadError::TransientNetwork(format!(
                    "media server answered {}",
                    status
                )));
            }
        }

        stream_to_file(
            response,
            destination,
            file_type,
            tier,
            &self.limits,
            cancel,
            false,
        )
        .await
    }
}

fn classify_player_url(
    body: PlayerUrlResponse,
    track_id: &str,
    tier: QualityTier,
) -> Result<StreamHandle, DownloadError> {
    if body.code == 301 {
        return Err(DownloadError::AuthExpired("netease session is not logged in".into()));
    }
    if body.code != 200 {
        return Err(DownloadError::TransientNetwork(format!(
            "player url returned code {}",
            body.code
        )));
    }

    let item = body
        .data
        .into_iter()
        .next()
        .ok_or_else(|| DownloadError::PermanentNotFound(track_id.to_string()))?;
    if matches!(item.code, 404 | -110) {
        return Err(DownloadError::PermanentNotFound(track_id.to_string()));
    }

    let Some(raw_url) = item.url.filter(|url| !url.is_empty()) else {
        return Err(DownloadError::QualityUnavailable(tier));
    };
    // Downgrades come back silently as a lower bitrate
    if item.br < tier.min_bitrate() {
        tracing::debug!(
            "NetEase offered {} bps for {} at tier {}",
            item.br,
            track_id,
            tier
        );
        return Err(DownloadError::QualityUnavailable(tier));
    }

    let url = Url::parse(&raw_url)
        .map_err(|err| DownloadError::TransientNetwork(format!("bad media url: {}", err)))?;
    Ok(StreamHandle::Direct {
        url,
        tier,
        file_type: extension_for(item.file_type.as_deref()),
    })
}

#[async_trait::async_trait]
impl PlatformDownloader for NeteaseDownloader {
    fn platform(&self) -> Platform {
        Platform::Netease
    }

    async fn resolve_stream(
        &self,
        track: &Track,
        tier: QualityTier,
        session: &str,
    ) -> Result<StreamHandle, DownloadError> {
        match self.route {
            Route::Direct => self.resolve_direct(track, tier, session).await,
            Route::Relay => {
                self.relay()?;
                Ok(StreamHandle::Relay {
                    platform: Platform::Netease,
                    track_id: track.id.clone(),
                    tier,
                    session_cookie: session.to_string(),
                })
            }
        }
    }

    async fn fetch(
        &self,
        handle: &StreamHandle,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile, DownloadError> {
        match handle {
            StreamHandle::Direct {
                url,
                tier,
                file_type,
            } => {
                self.fetch_direct(url, *tier, file_type, destination, cancel)
                    .await
            }
            StreamHandle::Relay { .. } => {
                fetch_via_relay(self.relay()?, handle, destination, &self.limits, cancel).await
            }
        }
    }
}

//! Client for the relay service that reaches geo-restricted platforms on our behalf.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::DownloadError;
use super::transfer::{TransferLimits, extension_for, stream_to_file};
use crate::config::RelayConfig;
use crate::models::{Platform, QualityTier, Track};
use crate::ports::platform::{FetchedFile, PlatformDownloader, StreamHandle};

const API_KEY_HEADER: &str = "X-API-Key";
const FILE_TYPE_HEADER: &str = "X-File-Type";
const QUALITY_HEADER: &str = "X-Quality";

/// Answer of `/{platform}/url/{track}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayUrl {
    #[serde(default)]
    pub success: bool,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub file_type: Option<String>,
    pub quality: Option<String>,
}

/// Answer of `/{platform}/diagnose`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayDiagnosis {
    pub cookie_valid: bool,
    pub uin: Option<String>,
    pub is_vip: Option<bool>,
    pub raw: serde_json::Value,
}

/// An open `/download` response whose body has not been read yet.
pub struct RelayStream {
    pub response: Response,
    pub file_type: String,
    /// Tier the relay says it delivered
    pub quality: Option<QualityTier>,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    client: Client,
    base_url: Url,
    api_key: String,
    /// Bound on getting response headers; bodies are bounded by the transfer limits
    request_timeout: Duration,
}

impl RelayClient {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .wrap_err_with(|| format!("Invalid relay url: {}", base_url))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            request_timeout,
        })
    }

    /// `None` when no relay is configured.
    pub fn from_config(
        client: Client,
        config: &RelayConfig,
        request_timeout: Duration,
    ) -> Result<Option<Self>> {
        match config.url.as_deref() {
            Some(url) => Ok(Some(Self::new(
                client,
                url,
                config.api_key.as_deref().unwrap_or_default(),
                request_timeout,
            )?)),
            None => Ok(None),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, DownloadError> {
        self.base_url
            .join(path)
            .map_err(|err| DownloadError::RelayUnreachable(format!("bad relay path: {}", err)))
    }

    fn request(&self, url: Url, platform: Platform, cookie: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header(platform.relay_cookie_header(), cookie);
        // An empty key is left off entirely so the relay can tell "missing" from "wrong"
        if !self.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &self.api_key);
        }
        request
    }

    async fn send(
        &self,
        request: RequestBuilder,
        tier: QualityTier,
    ) -> Result<Response, DownloadError> {
        let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
            Err(_) => {
                return Err(DownloadError::RelayUnreachable(format!(
                    "no response within {:?}",
                    self.request_timeout
                )));
            }
            Ok(Err(err)) => return Err(DownloadError::from_transport(&err, true)),
            Ok(Ok(response)) => response,
        };

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DownloadError::from_relay_status(
                response.status(),
                response.headers(),
                tier,
            ))
        }
    }

    /// Liveness check.
    pub async fn health(&self) -> Result<bool> {
        let url = self.base_url.join("health")?;
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .wrap_err("Failed to reach relay")?;
        Ok(response.status().is_success())
    }

    #[tracing::instrument(skip(self, cookie))]
    pub async fn resolve_url(
        &self,
        platform: Platform,
        track_id: &str,
        tier: QualityTier,
        cookie: &str,
    ) -> Result<RelayUrl, DownloadError> {
        let url = self.endpoint(&format!(
            "{}/url/{}",
            platform.relay_segment(),
            urlencoding::encode(track_id)
        ))?;
        let request = self
            .request(url, platform, cookie)
            .query(&[("quality", tier.as_str())]);
        let response = self.send(request, tier).await?;

        let body: RelayUrl = response
            .json()
            .await
            .map_err(|err| DownloadError::TransientNetwork(format!("bad relay body: {}", err)))?;
        if !body.success || body.url.as_deref().is_none_or(str::is_empty) {
            return Err(DownloadError::QualityUnavailable(tier));
        }
        Ok(body)
    }

    /// Open a byte stream for the track. The body is left for the caller to read.
    #[tracing::instrument(skip(self, cookie))]
    pub async fn open_download(
        &self,
        platform: Platform,
        track_id: &str,
        tier: QualityTier,
        cookie: &str,
    ) -> Result<RelayStream, DownloadError> {
        let url = self.endpoint(&format!(
            "{}/download/{}",
            platform.relay_segment(),
            urlencoding::encode(track_id)
        ))?;
        let request = self
            .request(url, platform, cookie)
            .query(&[("quality", tier.as_str())]);
        let response = self.send(request, tier).await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let file_type = extension_for(header(FILE_TYPE_HEADER).as_deref());
        let quality = header(QUALITY_HEADER).and_then(|q| q.parse::<QualityTier>().ok());

        Ok(RelayStream {
            response,
            file_type,
            quality,
        })
    }

    #[tracing::instrument(skip(self, cookie))]
    pub async fn diagnose(
        &self,
        platform: Platform,
        cookie: &str,
    ) -> Result<RelayDiagnosis, DownloadError> {
        let url = self.endpoint(&format!("{}/diagnose", platform.relay_segment()))?;
        let request = self.request(url, platform, cookie);
        // The tier only matters for 404s, which diagnose never answers with meaningfully
        let response = self.send(request, QualityTier::Standard).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|err| DownloadError::TransientNetwork(format!("bad relay body: {}", err)))?;
        Ok(RelayDiagnosis {
            cookie_valid: raw["cookie_valid"].as_bool().unwrap_or(false),
            uin: match &raw["uin"] {
                serde_json::Value::String(uin) if !uin.is_empty() => Some(uin.clone()),
                serde_json::Value::Number(uin) => Some(uin.to_string()),
                _ => None,
            },
            is_vip: raw["is_vip"].as_bool(),
            raw,
        })
    }
}

/// Downloads a platform's tracks entirely through the relay.
pub struct RelayDownloader {
    platform: Platform,
    relay: Option<Arc<RelayClient>>,
    limits: TransferLimits,
}

impl RelayDownloader {
    pub fn new(platform: Platform, relay: Option<Arc<RelayClient>>, limits: TransferLimits) -> Self {
        Self {
            platform,
            relay,
            limits,
        }
    }

    fn relay(&self) -> Result<&RelayClient, DownloadError> {
        self.relay.as_deref().ok_or_else(|| {
            DownloadError::RelayUnreachable(format!(
                "no relay configured for {}",
                self.platform
            ))
        })
    }
}

/// Fetch a relay handle into `destination`. Shared with downloaders that only
/// sometimes route through the relay.
pub async fn fetch_via_relay(
    relay: &RelayClient,
    handle: &StreamHandle,
    destination: &Path,
    limits: &TransferLimits,
    cancel: &CancellationToken,
) -> Result<FetchedFile, DownloadError> {
    let StreamHandle::Relay {
        platform,
        track_id,
        tier,
        session_cookie,
    } = handle
    else {
        return Err(DownloadError::Storage(
            "relay downloader was handed a direct stream".into(),
        ));
    };

    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        stream = relay.open_download(*platform, track_id, *tier, session_cookie) => stream?,
    };
    let delivered = stream.quality.unwrap_or(*tier);
    stream_to_file(
        stream.response,
        destination,
        &stream.file_type,
        delivered,
        limits,
        cancel,
        true,
    )
    .await
}

#[async_trait::async_trait]
impl PlatformDownloader for RelayDownloader {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn resolve_stream(
        &self,
        track: &Track,
        tier: QualityTier,
        session: &str,
    ) -> Result<StreamHandle, DownloadError> {
        // Fail early instead of at fetch time when the relay is missing
        self.relay()?;
        Ok(StreamHandle::Relay {
            platform: self.platform,
            track_id: track.id.clone(),
            tier,
            session_cookie: session.to_string(),
        })
    }

    async fn fetch(
        &self,
        handle: &StreamHandle,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile, DownloadError> {
        fetch_via_relay(self.relay()?, handle, destination, &self.limits, cancel).await
    }
}

//! Platform downloaders: resolve a track at one tier, then write its bytes to disk.

pub mod error;
pub mod fallback;
pub mod netease;
pub mod relay;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::eyre::{Result, eyre};
use reqwest::Client;

use crate::config::Config;
use crate::models::Platform;
use crate::ports::platform::PlatformDownloader;
use netease::NeteaseDownloader;
use relay::{RelayClient, RelayDownloader};
use transfer::TransferLimits;

/// One downloader per platform.
#[derive(Clone, Default)]
pub struct Downloaders {
    by_platform: HashMap<Platform, Arc<dyn PlatformDownloader>>,
}

impl Downloaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, downloader: Arc<dyn PlatformDownloader>) -> Self {
        self.by_platform.insert(downloader.platform(), downloader);
        self
    }

    /// NetEase per its configured route, QQ always via the relay.
    pub fn from_config(client: Client, config: &Config, relay: Option<Arc<RelayClient>>) -> Self {
        let limits = TransferLimits {
            inactivity_timeout: config.downloader.transfer_inactivity_timeout,
            min_bytes: config.downloader.min_file_size,
        };
        if relay.is_none() {
            tracing::warn!("No relay configured, QQ downloads will fail");
        }

        Self::new()
            .with(Arc::new(NeteaseDownloader::new(
                client,
                config.downloader.netease_route,
                relay.clone(),
                limits,
                config.downloader.resolve_timeout,
            )))
            .with(Arc::new(RelayDownloader::new(Platform::Qq, relay, limits)))
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformDownloader>> {
        self.by_platform
            .get(&platform)
            .cloned()
            .ok_or_else(|| eyre!("No downloader registered for {}", platform))
    }
}

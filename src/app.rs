use std::sync::Arc;

use color_eyre::eyre::{OptionExt, Result, WrapErr};
use reqwest::Client;

use crate::config::Config;
use crate::database::Database;
use crate::models::Platform;
use crate::ports::playlist_source::PlaylistSource;
use crate::ports::session::PlatformSession;
use crate::services::background::ServeSettings;
use crate::services::credentials::CredentialStore;
use crate::services::credentials::netease::NeteaseSession;
use crate::services::credentials::qq::{QqSession, principal_from_cookie};
use crate::services::downloader::Downloaders;
use crate::services::downloader::fallback::FallbackChains;
use crate::services::downloader::relay::RelayClient;
use crate::services::library::LibrarySnapshotStore;
use crate::services::library::emby::EmbyLibrary;
use crate::services::matching::Matcher;
use crate::services::queue::{QueueManager, QueueSettings};
use crate::services::reconcile::Reconciler;
use crate::services::reconcile::sources::{NeteasePlaylistSource, QqPlaylistSource};

const DEFAULT_PRINCIPAL: &str = "default";

/// Every service, wired from one config.
pub struct AppState {
    pub config: Config,
    pub relay: Option<Arc<RelayClient>>,
    pub credentials: CredentialStore,
    pub queue: QueueManager,
    /// Absent when no destination library is configured
    pub library: Option<Arc<LibrarySnapshotStore>>,
    pub reconciler: Option<Arc<Reconciler>>,
}

impl AppState {
    pub async fn build(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database_path()).await?);
        let client = Client::builder()
            .build()
            .wrap_err("Failed to create HTTP client")?;

        let relay = RelayClient::from_config(
            client.clone(),
            &config.relay,
            config.downloader.resolve_timeout,
        )?
        .map(Arc::new);
        if relay.is_none() {
            tracing::info!("No relay configured, QQ downloads are unavailable");
        }

        let sessions: Vec<Arc<dyn PlatformSession>> = vec![
            Arc::new(NeteaseSession::new(client.clone())),
            Arc::new(QqSession::new(
                relay.clone(),
                &config.credentials.qq_probe_track,
                config.downloader.default_quality,
            )),
        ];
        let credentials = CredentialStore::new(db.clone(), sessions, config.credentials.clone());
        seed_credentials(&credentials, &config).await?;

        let library = match config.library.url {
            Some(_) => {
                let emby = EmbyLibrary::from_config(client.clone(), &config.library)?;
                Some(Arc::new(LibrarySnapshotStore::new(
                    Arc::new(emby),
                    Some(config.library_cache_path()),
                )))
            }
            None => {
                tracing::info!("No library configured, reconciliation is unavailable");
                None
            }
        };

        let matcher = Matcher::new(&config.matching);
        let queue = QueueManager::new(
            db.clone(),
            Downloaders::from_config(client.clone(), &config, relay.clone()),
            credentials.clone(),
            library.clone(),
            matcher.clone(),
            QueueSettings {
                config: config.queue.clone(),
                chains: FallbackChains::from_config(&config.downloader)?,
                download_dir: config.download_dir(),
            },
        );

        let reconciler = library.as_ref().map(|library| {
            let sources: Vec<Arc<dyn PlaylistSource>> = vec![
                Arc::new(NeteasePlaylistSource::new(client.clone())),
                Arc::new(QqPlaylistSource::new(client.clone())),
            ];
            Arc::new(Reconciler::new(
                db.clone(),
                client.clone(),
                sources,
                library.clone(),
                matcher.clone(),
                queue.clone(),
                credentials.clone(),
                config.sync.clone(),
            ))
        });

        Ok(Self {
            config,
            relay,
            credentials,
            queue,
            library,
            reconciler,
        })
    }

    pub fn library(&self) -> Result<&Arc<LibrarySnapshotStore>> {
        self.library
            .as_ref()
            .ok_or_eyre("No library configured (set library.url or EMBY_URL)")
    }

    pub fn reconciler(&self) -> Result<&Arc<Reconciler>> {
        self.reconciler
            .as_ref()
            .ok_or_eyre("No library configured (set library.url or EMBY_URL)")
    }

    pub fn relay(&self) -> Result<&Arc<RelayClient>> {
        self.relay
            .as_ref()
            .ok_or_eyre("No relay configured (set relay.url or MUSIC_PROXY_URL)")
    }

    pub fn serve_settings(&self) -> ServeSettings {
        ServeSettings {
            sync: self.config.sync.clone(),
            library_scan_interval: self.config.library.scan_interval,
            credential_refresh_interval: self.config.credentials.refresh_interval,
        }
    }
}

/// Principal a cookie is stored under when none is given.
pub fn principal_for(platform: Platform, payload: &str) -> String {
    match platform {
        Platform::Qq => principal_from_cookie(payload),
        Platform::Netease => None,
    }
    .unwrap_or_else(|| DEFAULT_PRINCIPAL.to_string())
}

/// Cookies from the config file or environment become stored credentials.
async fn seed_credentials(credentials: &CredentialStore, config: &Config) -> Result<()> {
    for platform in [Platform::Netease, Platform::Qq] {
        if let Some(cookie) = config.seeded_cookie(platform) {
            credentials
                .seed(platform, &principal_for(platform, cookie), cookie)
                .await?;
        }
    }
    Ok(())
}

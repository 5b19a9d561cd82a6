//! Emby implementation of the `MediaLibrary` port.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use color_eyre::eyre::{OptionExt, Result, WrapErr, eyre};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::config::LibraryConfig;
use crate::ports::library::{CatalogEntry, MediaLibrary};

const CLIENT_NAME: &str = "music-sync";
const DEVICE_ID: &str = "music-sync-server";
const PAGE_SIZE: usize = 2000;

#[derive(Debug, Clone)]
enum EmbyAuth {
    Token { token: String, user_id: String },
    Password { username: String, password: String },
}

#[derive(Debug, Clone)]
struct EmbySession {
    token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticateResponse {
    access_token: String,
    user: AuthenticatedUser,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticatedUser {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<EmbyAudioItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyAudioItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    artist_items: Vec<EmbyNamed>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    album_artist: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmbyNamed {
    #[serde(default)]
    name: String,
}

impl From<EmbyAudioItem> for CatalogEntry {
    fn from(item: EmbyAudioItem) -> Self {
        let artist = item
            .artist_items
            .into_iter()
            .map(|a| a.name)
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let album = item
            .album
            .filter(|a| !a.is_empty())
            .or(item.album_artist)
            .unwrap_or_default();
        CatalogEntry {
            id: item.id,
            title: item.name,
            artist,
            album,
        }
    }
}

pub struct EmbyLibrary {
    client: Client,
    base_url: Url,
    auth: EmbyAuth,
    session: Mutex<Option<EmbySession>>,
}

impl EmbyLibrary {
    pub fn from_config(client: Client, config: &LibraryConfig) -> Result<Self> {
        let raw_url = config.url.as_deref().ok_or_eyre("library.url is not set")?;
        // Url::join drops the last segment without a trailing slash
        let base_url = Url::parse(&format!("{}/", raw_url.trim_end_matches('/')))
            .wrap_err_with(|| format!("Invalid library url: {}", raw_url))?;

        let auth = match (&config.api_token, &config.user_id, &config.username) {
            (Some(token), Some(user_id), _) => EmbyAuth::Token {
                token: token.clone(),
                user_id: user_id.clone(),
            },
            (_, _, Some(username)) => EmbyAuth::Password {
                username: username.clone(),
                password: config.password.clone().unwrap_or_default(),
            },
            _ => {
                return Err(eyre!(
                    "library needs either api_token + user_id or username + password"
                ));
            }
        };

        Ok(Self {
            client,
            base_url,
            auth,
            session: Mutex::new(None),
        })
    }

    fn authorization(&self, session: Option<&EmbySession>) -> String {
        let mut header = format!(
            r#"Emby Client="{}", Device="server", DeviceId="{}", Version="{}""#,
            CLIENT_NAME,
            DEVICE_ID,
            env!("CARGO_PKG_VERSION")
        );
        if let Some(session) = session {
            header = format!(
                r#"{}, UserId="{}", Token="{}""#,
                header, session.user_id, session.token
            );
        }
        header
    }

    async fn session(&self) -> Result<EmbySession> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        let session = match &self.auth {
            EmbyAuth::Token { token, user_id } => EmbySession {
                token: token.clone(),
                user_id: user_id.clone(),
            },
            EmbyAuth::Password { username, password } => {
                let url = self.base_url.join("emby/Users/AuthenticateByName")?;
                let res = self
                    .client
                    .post(url)
                    .query(&[("format", "json")])
                    .header("X-Emby-Authorization", self.authorization(None))
                    .header("Accept", "application/json")
                    .json(&serde_json::json!({ "Username": username, "Pw": password }))
                    .timeout(Duration::from_secs(20))
                    .send()
                    .await?
                    .error_for_status()
                    .wrap_err("Emby authentication failed")?
                    .json::<AuthenticateResponse>()
                    .await
                    .wrap_err("Failed to deserialize Emby authentication response")?;
                tracing::info!("Authenticated with Emby as {}", username);
                EmbySession {
                    token: res.access_token,
                    user_id: res.user.id,
                }
            }
        };

        *cached = Some(session.clone());
        Ok(session)
    }

    async fn fetch_page(&self, session: &EmbySession, start: usize) -> Result<Vec<EmbyAudioItem>> {
        let url = self
            .base_url
            .join(&format!("emby/Users/{}/Items", session.user_id))?;
        let start_index = start.to_string();
        let limit = PAGE_SIZE.to_string();

        let res = self
            .client
            .get(url)
            .query(&[
                ("format", "json"),
                ("IncludeItemTypes", "Audio"),
                ("Recursive", "true"),
                ("StartIndex", start_index.as_str()),
                ("Limit", limit.as_str()),
                ("Fields", "Id,Name,ArtistItems,Album,AlbumArtist"),
            ])
            .header("X-Emby-Authorization", self.authorization(Some(session)))
            .header("X-Emby-Token", &session.token)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(180))
            .send()
            .await?
            .error_for_status()
            .wrap_err("Failed to fetch Emby items page")?
            .json::<ItemsResponse>()
            .await
            .wrap_err("Failed to deserialize Emby items page")?;

        Ok(res.items)
    }
}

#[async_trait::async_trait]
impl MediaLibrary for EmbyLibrary {
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let session = self.session().await?;
        let mut catalog = Vec::new();
        let mut start = 0;

        loop {
            let items = (|| async { self.fetch_page(&session, start).await })
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(Duration::from_secs(1))
                        .with_max_times(3),
                )
                .notify(|err, delay| {
                    tracing::warn!("Retrying Emby page at {} in {:?}: {:#}", start, delay, err);
                })
                .await?;

            let page_len = items.len();
            catalog.extend(items.into_iter().map(CatalogEntry::from));
            tracing::debug!("Scanned {} library tracks", catalog.len());

            if page_len < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }

        Ok(catalog)
    }

    async fn trigger_rescan(&self) -> Result<()> {
        let session = self.session().await?;
        let url = self.base_url.join("emby/Library/Refresh")?;

        self.client
            .post(url)
            .header("X-Emby-Authorization", self.authorization(Some(&session)))
            .header("X-Emby-Token", &session.token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()
            .wrap_err("Failed to trigger Emby library refresh")?;

        tracing::info!("Triggered Emby library scan");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_maps_to_catalog_entry() {
        let item: EmbyAudioItem = serde_json::from_value(serde_json::json!({
            "Id": "123",
            "Name": "晴天",
            "ArtistItems": [{ "Name": "周杰伦" }, { "Name": "Lara" }],
            "Album": "",
            "AlbumArtist": "周杰伦"
        }))
        .unwrap();

        let entry = CatalogEntry::from(item);
        assert_eq!(entry.id, "123");
        assert_eq!(entry.artist, "周杰伦/Lara");
        assert_eq!(entry.album, "周杰伦");
    }

    #[test]
    fn test_config_requires_credentials() {
        let config = LibraryConfig {
            url: Some("http://emby.local:8096".into()),
            ..LibraryConfig::default()
        };
        assert!(EmbyLibrary::from_config(Client::new(), &config).is_err());

        let config = LibraryConfig {
            url: Some("http://emby.local:8096".into()),
            api_token: Some("tok".into()),
            user_id: Some("u1".into()),
            ..LibraryConfig::default()
        };
        let library = EmbyLibrary::from_config(Client::new(), &config).unwrap();
        assert_eq!(library.base_url.as_str(), "http://emby.local:8096/");
    }
}

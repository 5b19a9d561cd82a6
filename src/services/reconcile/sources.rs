//! Playlist readers for the source platforms.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{OptionExt, Result, WrapErr, eyre};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::direct::NotKeyed,
};
use reqwest::Client;
use reqwest::header::{REFERER, USER_AGENT};
use serde::Deserialize;

use crate::models::{Platform, Track};
use crate::ports::playlist_source::{PlaylistSource, SourcePlaylist};
use crate::services::downloader::netease::NETEASE_API_BASE;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub const QQ_PLAYLIST_URL: &str =
    "http://i.y.qq.com/qzone/fcg-bin/fcg_ucc_getcdinfo_byids_cp.fcg";

const BROWSER_AGENT: &str = "Mozilla/5.0";
const SONG_DETAIL_BATCH: usize = 200;
const NETEASE_REQUESTS_PER_SECOND: NonZeroU32 = NonZeroU32::new(5).unwrap();

#[derive(Debug, Deserialize)]
struct Artist {
    #[serde(default)]
    name: String,
}

fn join_artists(artists: &[Artist]) -> String {
    artists
        .iter()
        .map(|a| a.name.as_str())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// The handful of entities the platforms leave escaped in names.
fn unescape_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[derive(Debug, Deserialize)]
struct PlaylistDetailResponse {
    code: i64,
    playlist: Option<PlaylistDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistDetail {
    name: Option<String>,
    #[serde(default)]
    track_ids: Vec<TrackIdRef>,
}

#[derive(Debug, Deserialize)]
struct TrackIdRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SongDetailResponse {
    #[serde(default)]
    songs: Vec<SongDetail>,
}

#[derive(Debug, Deserialize)]
struct SongDetail {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default, alias = "artists")]
    ar: Vec<Artist>,
    #[serde(alias = "album")]
    al: Option<AlbumRef>,
    #[serde(alias = "duration")]
    dt: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    #[serde(default)]
    name: String,
}

pub struct NeteasePlaylistSource {
    client: Client,
    api_base: String,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl NeteasePlaylistSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_base: NETEASE_API_BASE.to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NETEASE_REQUESTS_PER_SECOND,
            ))),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = format!("{}/", api_base.trim_end_matches('/'));
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;
        self.client
            .get(format!("{}{}", self.api_base, path))
            .query(query)
            .header(REFERER, "https://music.163.com/")
            .header(USER_AGENT, BROWSER_AGENT)
            .timeout(Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()
            .wrap_err_with(|| format!("NetEase {} failed", path))?
            .json::<T>()
            .await
            .wrap_err_with(|| format!("Failed to deserialize NetEase {} response", path))
    }
}

#[async_trait::async_trait]
impl PlaylistSource for NeteasePlaylistSource {
    fn platform(&self) -> Platform {
        Platform::Netease
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_playlist(&self, playlist_id: &str) -> Result<SourcePlaylist> {
        let detail: PlaylistDetailResponse = self
            .get_json(
                "api/v3/playlist/detail",
                &[("id", playlist_id), ("n", "100000")],
            )
            .await?;
        if detail.code != 200 {
            return Err(eyre!(
                "NetEase refused playlist {} with code {}",
                playlist_id,
                detail.code
            ));
        }
        let playlist = detail
            .playlist
            .ok_or_eyre(format!("NetEase playlist {} not found", playlist_id))?;
        let name = playlist
            .name
            .map(|n| unescape_entities(&n))
            .unwrap_or_else(|| format!("NetEase playlist {}", playlist_id));
        let ids: Vec<String> = playlist
            .track_ids
            .iter()
            .map(|t| t.id.to_string())
            .collect();

        let mut details: HashMap<String, SongDetail> = HashMap::new();
        for batch in ids.chunks(SONG_DETAIL_BATCH) {
            let ids_param = format!("[{}]", batch.join(","));
            let response: SongDetailResponse = self
                .get_json("api/song/detail/", &[("ids", &ids_param)])
                .await?;
            tracing::debug!(
                "Fetched {} of {} song details for playlist {}",
                response.songs.len(),
                batch.len(),
                playlist_id
            );
            details.extend(response.songs.into_iter().map(|s| (s.id.to_string(), s)));
        }

        // Playlist order, not detail-response order
        let tracks = ids
            .iter()
            .filter_map(|id| details.remove(id))
            .map(|song| Track {
                id: song.id.to_string(),
                title: unescape_entities(&song.name),
                artist: unescape_entities(&join_artists(&song.ar)),
                album: song
                    .al
                    .map(|al| unescape_entities(&al.name))
                    .unwrap_or_default(),
                duration_ms: song.dt,
                platform: Platform::Netease,
            })
            .collect();

        Ok(SourcePlaylist { name, tracks })
    }
}

#[derive(Debug, Deserialize)]
struct QqPlaylistResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    cdlist: Vec<QqDisst>,
}

#[derive(Debug, Deserialize)]
struct QqDisst {
    dissname: Option<String>,
    #[serde(default)]
    songlist: Vec<QqSong>,
}

#[derive(Debug, Deserialize)]
struct QqSong {
    songmid: Option<String>,
    songid: Option<i64>,
    #[serde(default, alias = "title")]
    songname: String,
    #[serde(default)]
    albumname: String,
    #[serde(default)]
    singer: Vec<Artist>,
    /// Seconds
    interval: Option<u64>,
}

/// The endpoint answers JSONP unless asked nicely; take what is inside the callback.
pub fn strip_jsonp(body: &str) -> &str {
    let body = body.trim();
    if body.starts_with('{') {
        return body;
    }
    match (body.find('('), body.rfind(')')) {
        (Some(open), Some(close)) if open < close => body[open + 1..close].trim(),
        _ => body,
    }
}

pub struct QqPlaylistSource {
    client: Client,
    endpoint: String,
}

impl QqPlaylistSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: QQ_PLAYLIST_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[async_trait::async_trait]
impl PlaylistSource for QqPlaylistSource {
    fn platform(&self) -> Platform {
        Platform::Qq
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_playlist(&self, playlist_id: &str) -> Result<SourcePlaylist> {
        let body = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("type", "1"),
                ("utf8", "1"),
                ("disstid", playlist_id),
                ("loginUin", "0"),
            ])
            .header(REFERER, "https://y.qq.com/")
            .header(USER_AGENT, BROWSER_AGENT)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()
            .wrap_err("QQ playlist request failed")?
            .text()
            .await
            .wrap_err("Failed to read QQ playlist response")?;

        let response: QqPlaylistResponse = serde_json::from_str(strip_jsonp(&body))
            .wrap_err("Failed to deserialize QQ playlist response")?;
        let disst = response.cdlist.into_iter().next().ok_or_eyre(format!(
            "QQ playlist {} not found (code {})",
            playlist_id, response.code
        ))?;

        let name = disst
            .dissname
            .map(|n| unescape_entities(&n))
            .unwrap_or_else(|| format!("QQ playlist {}", playlist_id));
        let tracks = disst
            .songlist
            .into_iter()
            .filter_map(|song| {
                let id = song
                    .songmid
                    .filter(|mid| !mid.is_empty())
                    .or_else(|| song.songid.map(|id| id.to_string()))?;
                Some(Track {
                    id,
                    title: unescape_entities(&song.songname),
                    artist: unescape_entities(&join_artists(&song.singer)),
                    album: unescape_entities(&song.albumname),
                    duration_ms: song.interval.map(|secs| secs * 1000),
                    platform: Platform::Qq,
                })
            })
            .collect();

        Ok(SourcePlaylist { name, tracks })
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_strip_jsonp() {
        assert_eq!(strip_jsonp("callback({\"code\":0})"), "{\"code\":0}");
        assert_eq!(strip_jsonp(" MusicJsonCallback({\"a\":1}); "), "{\"a\":1}");
        assert_eq!(strip_jsonp("{\"code\":0}"), "{\"code\":0}");
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(unescape_entities("Tom &amp; Jerry&#39;s"), "Tom & Jerry's");
        assert_eq!(unescape_entities("&amp;lt;"), "&lt;");
    }

    #[tokio::test]
    async fn test_netease_playlist_batches_details_in_playlist_order() {
        let app = Router::new()
            .route(
                "/api/v3/playlist/detail",
                get(|| async {
                    let ids: Vec<_> = (1..=250).map(|id| serde_json::json!({ "id": id })).collect();
                    axum::Json(serde_json::json!({
                        "code": 200,
                        "playlist": { "name": "夜跑 &amp; 通勤", "trackIds": ids }
                    }))
                }),
            )
            .route(
                "/api/song/detail/",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let ids: Vec<i64> = serde_json::from_str(&q["ids"]).unwrap();
                    assert!(ids.len() <= 200);
                    // Reversed on purpose
                    let songs: Vec<_> = ids
                        .iter()
                        .rev()
                        .map(|id| {
                            serde_json::json!({
                                "id": id,
                                "name": format!("Song {}", id),
                                "ar": [{ "name": "A" }, { "name": "B" }],
                                "al": { "name": "Album" },
                                "dt": 200000
                            })
                        })
                        .collect();
                    axum::Json(serde_json::json!({ "code": 200, "songs": songs }))
                }),
            );
        let base = serve(app).await;

        let source = NeteasePlaylistSource::new(Client::new()).with_api_base(&base);
        let playlist = source.fetch_playlist("42").await.unwrap();

        assert_eq!(playlist.name, "夜跑 & 通勤");
        assert_eq!(playlist.tracks.len(), 250);
        assert_eq!(playlist.tracks[0].id, "1");
        assert_eq!(playlist.tracks[249].id, "250");
        assert_eq!(playlist.tracks[0].artist, "A/B");
        assert_eq!(playlist.tracks[0].duration_ms, Some(200_000));
    }

    #[tokio::test]
    async fn test_netease_refusal_is_an_error() {
        let app = Router::new().route(
            "/api/v3/playlist/detail",
            get(|| async { axum::Json(serde_json::json!({ "code": 404 })) }),
        );
        let base = serve(app).await;

        let source = NeteasePlaylistSource::new(Client::new()).with_api_base(&base);
        assert!(source.fetch_playlist("42").await.is_err());
    }

    #[tokio::test]
    async fn test_qq_playlist_from_jsonp() {
        let app = Router::new().route(
            "/playlist",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q["disstid"], "7256912512");
                let body = serde_json::json!({
                    "code": 0,
                    "cdlist": [{
                        "dissname": "周末",
                        "songlist": [
                            {
                                "songmid": "003OUlho2HcRHC",
                                "songid": 97773,
                                "songname": "晴天",
                                "albumname": "叶惠美",
                                "singer": [{ "name": "周杰伦" }],
                                "interval": 269
                            },
                            {
                                "songid": 12345,
                                "songname": "No Mid",
                                "singer": [{ "name": "甲" }, { "name": "乙" }]
                            },
                            { "songname": "No Id" }
                        ]
                    }]
                });
                format!("jsonCallback({})", body)
            }),
        );
        let base = serve(app).await;

        let source =
            QqPlaylistSource::new(Client::new()).with_endpoint(&format!("{}/playlist", base));
        let playlist = source.fetch_playlist("7256912512").await.unwrap();

        assert_eq!(playlist.name, "周末");
        assert_eq!(playlist.tracks.len(), 2);
        assert_eq!(playlist.tracks[0].id, "003OUlho2HcRHC");
        assert_eq!(playlist.tracks[0].duration_ms, Some(269_000));
        assert_eq!(playlist.tracks[1].id, "12345");
        assert_eq!(playlist.tracks[1].artist, "甲/乙");
    }

    #[tokio::test]
    async fn test_qq_empty_cdlist_is_an_error() {
        let app = Router::new().route(
            "/playlist",
            get(|| async { "callback({\"code\":-1,\"cdlist\":[]})" }),
        );
        let base = serve(app).await;

        let source =
            QqPlaylistSource::new(Client::new()).with_endpoint(&format!("{}/playlist", base));
        assert!(source.fetch_playlist("1").await.is_err());
    }
}

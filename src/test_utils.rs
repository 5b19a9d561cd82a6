use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::StreamExt;
use sea_orm::{ConnectOptions, Database as SeaDatabase};

use crate::database::Database;
use crate::models::QualityTier;
use crate::services::downloader::relay::RelayClient;

pub async fn test_db() -> Arc<Database> {
    // A single connection, otherwise every pooled connection gets its own empty database.
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let conn = SeaDatabase::connect(opt).await.unwrap();
    Arc::new(Database::from_connection(conn).await.unwrap())
}

/// Behaviour of the in-process relay used by downloader and queue tests.
#[derive(Clone)]
pub struct FakeRelay {
    pub api_key: String,
    /// Tiers answered with 404
    pub unavailable: Vec<QualityTier>,
    /// Cookies answered with 401
    pub expired_cookies: Vec<String>,
    pub body_len: usize,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self {
            api_key: "secret".into(),
            unavailable: Vec::new(),
            expired_cookies: Vec::new(),
            body_len: 20_000,
        }
    }
}

struct FakeRelayState {
    behaviour: FakeRelay,
    downloads: Mutex<Vec<String>>,
}

pub struct FakeRelayHandle {
    pub url: String,
    state: Arc<FakeRelayState>,
}

impl FakeRelayHandle {
    pub fn client(&self, api_key: &str) -> RelayClient {
        RelayClient::new(
            reqwest::Client::new(),
            &self.url,
            api_key,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// Quality parameter of every `/download` request received, in order
    pub fn download_requests(&self) -> Vec<String> {
        self.state.downloads.lock().unwrap().clone()
    }
}

pub async fn spawn_fake_relay(behaviour: FakeRelay) -> FakeRelayHandle {
    let state = Arc::new(FakeRelayState {
        behaviour,
        downloads: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/{platform}/url/{track_id}", get(fake_url))
        .route("/{platform}/download/{track_id}", get(fake_download))
        .route("/{platform}/diagnose", get(fake_diagnose))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeRelayHandle {
        url: format!("http://{}", addr),
        state,
    }
}

fn check_headers(
    state: &FakeRelayState,
    platform: &str,
    headers: &HeaderMap,
) -> Result<String, StatusCode> {
    let key = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if key != Some(state.behaviour.api_key.as_str()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let cookie_header = if platform == "ncm" {
        "X-NCM-Cookie"
    } else {
        "X-QQ-Cookie"
    };
    let cookie = headers
        .get(cookie_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    if state.behaviour.expired_cookies.iter().any(|c| c == cookie) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(cookie.to_string())
}

fn requested_tier(state: &FakeRelayState, query: &HashMap<String, String>) -> Result<String, StatusCode> {
    let quality = query
        .get("quality")
        .cloned()
        .unwrap_or_else(|| "standard".into());
    let unavailable = state
        .behaviour
        .unavailable
        .iter()
        .any(|tier| tier.as_str() == quality);
    if unavailable {
        Err(StatusCode::NOT_FOUND)
    } else {
        Ok(quality)
    }
}

async fn fake_url(
    State(state): State<Arc<FakeRelayState>>,
    AxumPath((platform, track_id)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_headers(&state, &platform, &headers) {
        return status.into_response();
    }
    match requested_tier(&state, &query) {
        Ok(quality) => Json(serde_json::json!({
            "success": true,
            "url": format!("https://cdn.example/{}.flac", track_id),
            "type": "flac",
            "quality": quality,
        }))
        .into_response(),
        Err(status) => status.into_response(),
    }
}

async fn fake_download(
    State(state): State<Arc<FakeRelayState>>,
    AxumPath((platform, track_id)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_headers(&state, &platform, &headers) {
        return status.into_response();
    }
    let quality = query
        .get("quality")
        .cloned()
        .unwrap_or_else(|| "standard".into());
    state.downloads.lock().unwrap().push(quality);
    let quality = match requested_tier(&state, &query) {
        Ok(quality) => quality,
        Err(status) => return status.into_response(),
    };

    let body = if track_id == "stall" {
        // One chunk, then silence
        let first = futures::stream::once(async {
            Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1_000]))
        });
        Body::from_stream(first.chain(futures::stream::pending()))
    } else {
        Body::from(vec![0u8; state.behaviour.body_len])
    };

    (
        [("X-File-Type", "flac".to_string()), ("X-Quality", quality)],
        body,
    )
        .into_response()
}

async fn fake_diagnose(
    State(state): State<Arc<FakeRelayState>>,
    AxumPath(platform): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    match check_headers(&state, &platform, &headers) {
        Ok(cookie) => {
            let uin = cookie
                .split(';')
                .find_map(|part| part.trim().strip_prefix("uin="))
                .unwrap_or_default()
                .to_string();
            Json(serde_json::json!({
                "cookie_valid": true,
                "uin": uin,
                "is_vip": true,
                "region": "cn",
            }))
            .into_response()
        }
        Err(status) => status.into_response(),
    }
}

use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr, eyre};
use reqwest::Client;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::Deserialize;

use crate::entities::credential::ProbeTier;
use crate::models::Platform;
use crate::ports::session::{AccountProfile, PlatformSession, ProbeOutcome};
use crate::services::downloader::netease::NETEASE_API_BASE;

const NOT_LOGGED_IN: i64 = 301;

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: i64,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    code: i64,
    account: Option<Account>,
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    #[serde(default)]
    vip_type: i64,
}

#[derive(Debug, Deserialize)]
struct Profile {
    nickname: Option<String>,
}

pub struct NeteaseSession {
    client: Client,
    api_base: String,
}

impl NeteaseSession {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_base: NETEASE_API_BASE.to_string(),
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
        payload: &str,
    ) -> Result<T> {
        self.client
            .get(format!("{}{}", self.api_base, path))
            .query(query)
            .header(COOKIE, payload)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()
            .wrap_err_with(|| format!("NetEase {} failed", path))?
            .json::<T>()
            .await
            .wrap_err_with(|| format!("Failed to deserialize NetEase {} response", path))
    }
}

fn outcome_for_code(code: i64) -> ProbeOutcome {
    match code {
        200 => ProbeOutcome::Valid(None),
        NOT_LOGGED_IN => ProbeOutcome::Rejected("not logged in".into()),
        code => ProbeOutcome::Denied(format!("code {}", code)),
    }
}

/// Apply `Set-Cookie` values on top of a `k=v; k=v` cookie string.
pub fn merge_cookies<'a>(payload: &str, set_cookies: impl IntoIterator<Item = &'a str>) -> String {
    let mut pairs: Vec<(String, String)> = payload
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    for set_cookie in set_cookies {
        let Some((name, value)) = set_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.trim().split_once('='))
        else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        match pairs.iter_mut().find(|(k, _)| k == name) {
            Some(existing) => existing.1 = value.to_string(),
            None => pairs.push((name.to_string(), value.to_string())),
        }
    }

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait::async_trait]
impl PlatformSession for NeteaseSession {
    fn platform(&self) -> Platform {
        Platform::Netease
    }

    async fn probe(&self, tier: ProbeTier, principal: &str, payload: &str) -> Result<ProbeOutcome> {
        match tier {
            ProbeTier::AccountProfile => {
                let res: AccountResponse =
                    self.get_json("api/nuser/account/get", &[], payload).await?;
                match (res.code, res.account) {
                    (200, Some(account)) => Ok(ProbeOutcome::Valid(Some(AccountProfile {
                        nickname: res.profile.and_then(|p| p.nickname),
                        is_vip: Some(account.vip_type > 0),
                    }))),
                    // Anonymous sessions get 200 without an account
                    (200, None) => Ok(ProbeOutcome::Denied("no account on session".into())),
                    (code, _) => Ok(outcome_for_code(code)),
                }
            }
            ProbeTier::OwnedResources => {
                let res: CodeResponse = self
                    .get_json(
                        "api/user/playlist",
                        &[("uid", principal), ("limit", "1")],
                        payload,
                    )
                    .await?;
                Ok(outcome_for_code(res.code))
            }
            ProbeTier::PublicConfig => {
                let res: CodeResponse = self
                    .get_json("api/discovery/recommend/songs", &[], payload)
                    .await?;
                Ok(outcome_for_code(res.code))
            }
        }
    }

    async fn renew(&self, _principal: &str, payload: &str) -> Result<Option<String>> {
        let response = self
            .client
            .post(format!("{}api/login/token/refresh", self.api_base))
            .header(COOKIE, payload)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()
            .wrap_err("NetEase token refresh failed")?;

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let res: CodeResponse = response
            .json()
            .await
            .wrap_err("Failed to deserialize NetEase token refresh response")?;
        if res.code != 200 {
            return Err(eyre!("NetEase token refresh returned code {}", res.code));
        }

        Ok(Some(merge_cookies(
            payload,
            set_cookies.iter().map(String::as_str),
        )))
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};

    use super::*;

    #[test]
    fn test_merge_cookies_replaces_and_appends() {
        let merged = merge_cookies(
            "MUSIC_U=old; __csrf=abc",
            [
                "MUSIC_U=new; Max-Age=1296000; Path=/",
                "NMTID=xyz; Path=/",
            ],
        );
        assert_eq!(merged, "MUSIC_U=new; __csrf=abc; NMTID=xyz");
    }

    async fn spawn_fake_netease() -> String {
        let logged_in = |headers: &HeaderMap| {
            headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|c| c.contains("MUSIC_U=good"))
        };
        let app = Router::new()
            .route(
                "/api/nuser/account/get",
                get(move |headers: HeaderMap| async move {
                    if logged_in(&headers) {
                        axum::Json(serde_json::json!({
                            "code": 200,
                            "account": { "id": 42, "vipType": 11 },
                            "profile": { "nickname": "晴天娃娃" }
                        }))
                    } else {
                        axum::Json(serde_json::json!({ "code": 200, "account": null }))
                    }
                }),
            )
            .route(
                "/api/user/playlist",
                get(|| async { axum::Json(serde_json::json!({ "code": 301 })) }),
            )
            .route(
                "/api/discovery/recommend/songs",
                get(|| async { axum::Json(serde_json::json!({ "code": 200 })) }),
            )
            .route(
                "/api/login/token/refresh",
                post(|| async {
                    (
                        [("set-cookie", "MUSIC_U=renewed; Path=/")],
                        axum::Json(serde_json::json!({ "code": 200 })),
                    )
                        .into_response()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_probes_against_fake_api() {
        let base = spawn_fake_netease().await;
        let session = NeteaseSession::new(Client::new()).with_api_base(&base);

        let outcome = session
            .probe(ProbeTier::AccountProfile, "42", "MUSIC_U=good")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::Valid(Some(AccountProfile {
                nickname: Some("晴天娃娃".into()),
                is_vip: Some(true),
            }))
        );
        assert!(matches!(
            session
                .probe(ProbeTier::AccountProfile, "42", "MUSIC_U=bad")
                .await
                .unwrap(),
            ProbeOutcome::Denied(_)
        ));
        assert!(matches!(
            session
                .probe(ProbeTier::OwnedResources, "42", "MUSIC_U=good")
                .await
                .unwrap(),
            ProbeOutcome::Rejected(_)
        ));
        assert_eq!(
            session
                .probe(ProbeTier::PublicConfig, "42", "MUSIC_U=good")
                .await
                .unwrap(),
            ProbeOutcome::Valid(None)
        );
    }

    #[tokio::test]
    async fn test_renew_merges_set_cookie() {
        let base = spawn_fake_netease().await;
        let session = NeteaseSession::new(Client::new()).with_api_base(&base);

        let renewed = session
            .renew("42", "MUSIC_U=good; __csrf=abc")
            .await
            .unwrap();
        assert_eq!(renewed.as_deref(), Some("MUSIC_U=renewed; __csrf=abc"));
    }
}

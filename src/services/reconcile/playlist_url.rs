use std::time::Duration;

use color_eyre::eyre::{OptionExt, Result, WrapErr};
use regex::Regex;
use reqwest::Client;

use crate::models::Platform;

const NETEASE_PATTERNS: [&str; 2] = [
    r"music\.163\.com.*[?&/#]id=(\d+)",
    r"music\.163\.com/(?:#/)?playlist/(\d+)",
];

const QQ_PATTERNS: [&str; 2] = [
    r"y\.qq\.com/n/ryqq/playlist/(\d+)",
    r"(?:y|i)\.qq\.com/.*?[?&](?:id|dissid)=(\d+)",
];

/// Hosts that only redirect to the real share page
const SHORT_LINK_HOSTS: [&str; 2] = ["163cn.tv", "c6.y.qq.com"];

/// Pull the first URL out of pasted share text, or the text itself.
pub fn extract_url(input: &str) -> &str {
    let input = input.trim();
    let Some(start) = input.find("https://").or_else(|| input.find("http://")) else {
        return input;
    };
    let rest = &input[start..];
    rest.split_whitespace().next().unwrap_or(rest)
}

pub fn is_short_link(url: &str) -> bool {
    SHORT_LINK_HOSTS.iter().any(|host| url.contains(host))
}

/// Recognise a playlist share URL. Short links must be resolved first.
pub fn parse_playlist_url(url: &str) -> Result<Option<(Platform, String)>> {
    let url = extract_url(url);
    let candidates = [(Platform::Netease, NETEASE_PATTERNS), (Platform::Qq, QQ_PATTERNS)];
    for (platform, patterns) in candidates {
        for pattern in patterns {
            let re = Regex::new(pattern).wrap_err("Failed to create regex")?;
            if let Some(caps) = re.captures(url) {
                return Ok(Some((platform, caps[1].to_string())));
            }
        }
    }
    Ok(None)
}

/// Follow a short link's redirects to the page it points at.
pub async fn resolve_short_link(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .wrap_err_with(|| format!("Failed to resolve short link {}", url))?;
    Ok(response.url().to_string())
}

/// `parse_playlist_url`, resolving short links through the network when needed.
pub async fn resolve_playlist_input(client: &Client, input: &str) -> Result<(Platform, String)> {
    let mut url = extract_url(input).to_string();
    if is_short_link(&url) {
        url = resolve_short_link(client, &url).await?;
        tracing::debug!("Short link resolved to {}", url);
    }
    parse_playlist_url(&url)?
        .ok_or_eyre(format!("Not a recognised playlist link: {}", input))
}

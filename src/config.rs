use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{Platform, QualityTier};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to write config file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize config")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available on this system")]
    NoConfigDir,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub library: LibraryConfig,
    pub matching: MatchingConfig,
    pub queue: QueueConfig,
    pub downloader: DownloaderConfig,
    pub relay: RelayConfig,
    pub credentials: CredentialsConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds the database and the library cache
    pub data_dir: String,
    /// Finished downloads land here
    pub download_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join("music-sync").display().to_string())
            .unwrap_or_else(|| "~/.music-sync".to_string());
        Self {
            download_dir: format!("{}/downloads", data_dir),
            data_dir,
        }
    }
}

/// Destination library (Emby) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued API token, used together with `user_id` instead of a password login
    pub api_token: Option<String>,
    pub user_id: Option<String>,
    /// Zero disables periodic refresh
    #[serde(with = "duration_str")]
    pub scan_interval: Duration,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            api_token: None,
            user_id: None,
            scan_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub present_threshold: f64,
    pub ambiguous_threshold: f64,
    /// Share of the score that comes from the title; the rest comes from artists
    pub title_weight: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            present_threshold: 0.85,
            ambiguous_threshold: 0.60,
            title_weight: 2.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_retries: u32,
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    pub rate_limit_multiplier: u32,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Finished jobs older than this are removed by `clean`
    #[serde(with = "duration_str")]
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(5 * 60),
            rate_limit_multiplier: 4,
            poll_interval: Duration::from_secs(5),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub default_quality: QualityTier,
    #[serde(with = "duration_str")]
    pub resolve_timeout: Duration,
    #[serde(with = "duration_str")]
    pub transfer_inactivity_timeout: Duration,
    /// Smaller files are treated as stubs and discarded
    pub min_file_size: u64,
    pub netease_route: Route,
    /// Overrides of the fallback chain, keyed by requested tier name
    pub fallback: BTreeMap<String, Vec<QualityTier>>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            default_quality: QualityTier::Exhigh,
            resolve_timeout: Duration::from_secs(30),
            transfer_inactivity_timeout: Duration::from_secs(120),
            min_file_size: 10_000,
            netease_route: Route::Direct,
            fallback: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    #[serde(with = "duration_str")]
    pub refresh_interval: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    /// Warn when the last valid check is older than this
    #[serde(with = "duration_str")]
    pub warn_after: Duration,
    /// Expected lifetime of a freshly renewed session
    #[serde(with = "duration_str")]
    pub assumed_lifetime: Duration,
    /// Seeded as a credential on startup when set
    pub netease_cookie: Option<String>,
    pub qq_cookie: Option<String>,
    /// Track used by the QQ entitlement probes
    pub qq_probe_track: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(6 * 60 * 60),
            probe_timeout: Duration::from_secs(10),
            warn_after: Duration::from_secs(5 * 24 * 60 * 60),
            assumed_lifetime: Duration::from_secs(14 * 24 * 60 * 60),
            netease_cookie: None,
            qq_cookie: None,
            qq_probe_track: "0039MnYb0qxYhV".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "duration_str")]
    pub default_interval: Duration,
    #[serde(with = "duration_str")]
    pub min_interval: Duration,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub initial_delay: Duration,
    #[serde(with = "duration_str")]
    pub error_pause: Duration,
    #[serde(with = "duration_str")]
    pub rescan_debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(360 * 60),
            min_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(10),
            error_pause: Duration::from_secs(60),
            rescan_debounce: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load config from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|path| path.join("music-sync").join("config.toml"))
    }

    /// Load the default config file, falling back to built-in defaults when it
    /// doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        if config_path.exists() {
            return Self::from_file(&config_path);
        }
        tracing::debug!(
            "No config file at {}, using defaults",
            config_path.display()
        );
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Write the default config, if there isn't one yet
    pub fn create_default() -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        if config_path.exists() {
            return Ok(config_path);
        }
        let write_err = |source| ConfigError::Write {
            path: config_path.clone(),
            source,
        };
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let contents = toml::to_string_pretty(&Config::default())?;
        std::fs::write(&config_path, contents).map_err(write_err)?;
        Ok(config_path)
    }

    /// Environment variables understood by the deployment images
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()));
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(dir) = var("MUSIC_TARGET_DIR") {
            self.storage.download_dir = dir;
        }
        if let Some(url) = var("EMBY_URL") {
            self.library.url = Some(url);
        }
        if let Some(username) = var("EMBY_USERNAME") {
            self.library.username = Some(username);
        }
        if let Some(password) = var("EMBY_PASSWORD") {
            self.library.password = Some(password);
        }
        // Hours, 0 disables
        if let Some(hours) = var("EMBY_SCAN_INTERVAL").and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.library.scan_interval = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(cookie) = var("NCM_COOKIE") {
            self.credentials.netease_cookie = Some(cookie);
        }
        if let Some(cookie) = var("QQ_COOKIE") {
            self.credentials.qq_cookie = Some(cookie);
        }
        if let Some(quality) = var("NCM_QUALITY").and_then(|v| v.parse::<QualityTier>().ok()) {
            self.downloader.default_quality = quality;
        }
        if let Some(url) = var("MUSIC_PROXY_URL") {
            self.relay.url = Some(url);
        }
        if let Some(key) = var("MUSIC_PROXY_KEY") {
            self.relay.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.ambiguous_threshold)
            || !(0.0..=1.0).contains(&m.present_threshold)
            || m.ambiguous_threshold > m.present_threshold
        {
            return Err(ConfigError::Invalid(format!(
                "matching thresholds must satisfy 0 <= ambiguous ({}) <= present ({}) <= 1",
                m.ambiguous_threshold, m.present_threshold
            )));
        }
        if !(0.0..=1.0).contains(&m.title_weight) {
            return Err(ConfigError::Invalid(format!(
                "matching.title_weight must be within [0, 1], got {}",
                m.title_weight
            )));
        }
        if self.queue.workers == 0 {
            return Err(ConfigError::Invalid("queue.workers must be at least 1".into()));
        }
        for (tier, chain) in &self.downloader.fallback {
            let requested = tier.parse::<QualityTier>().map_err(|_| {
                ConfigError::Invalid(format!("unknown tier in downloader.fallback: {}", tier))
            })?;
            if chain.first() != Some(&requested) {
                return Err(ConfigError::Invalid(format!(
                    "fallback chain for {} must start with {}",
                    requested, requested
                )));
            }
            let mut seen = chain.clone();
            seen.sort();
            seen.dedup();
            if seen.len() != chain.len() {
                return Err(ConfigError::Invalid(format!(
                    "fallback chain for {} lists a tier twice",
                    requested
                )));
            }
        }
        Ok(())
    }

    /// Expand ~ to home directory
    fn expand_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.expand_path(&self.storage.data_dir)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.expand_path(&self.storage.download_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("music-sync.db")
    }

    pub fn library_cache_path(&self) -> PathBuf {
        self.data_dir().join("library_cache.json")
    }

    /// Cookie configured through the environment or config file for a platform
    pub fn seeded_cookie(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Netease => self.credentials.netease_cookie.as_deref(),
            Platform::Qq => self.credentials.qq_cookie.as_deref(),
        }
    }
}

/// (De)serialize a `Duration` as a humantime string such as `"6h"` or `"120s"`.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_parses_partial_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[matching]
present_threshold = 0.9

[queue]
workers = 5
backoff_base = "500ms"

[downloader.fallback]
hires = ["hires", "exhigh"]
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.matching.present_threshold, 0.9);
        assert_eq!(config.matching.ambiguous_threshold, 0.60);
        assert_eq!(config.queue.workers, 5);
        assert_eq!(config.queue.backoff_base, Duration::from_millis(500));
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(
            config.downloader.fallback.get("hires"),
            Some(&vec![QualityTier::Hires, QualityTier::Exhigh])
        );
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.matching.present_threshold = 0.5;
        config.matching.ambiguous_threshold = 0.7;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_chain_with_repeated_tier() {
        let mut config = Config::default();
        config.downloader.fallback.insert(
            "lossless".into(),
            vec![
                QualityTier::Lossless,
                QualityTier::Standard,
                QualityTier::Lossless,
            ],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MUSIC_PROXY_URL", "https://relay.example"),
            ("NCM_QUALITY", "lossless"),
            ("EMBY_SCAN_INTERVAL", "0"),
            ("QQ_COOKIE", "uin=1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.relay.url.as_deref(), Some("https://relay.example"));
        assert_eq!(config.downloader.default_quality, QualityTier::Lossless);
        assert_eq!(config.library.scan_interval, Duration::ZERO);
        assert_eq!(config.seeded_cookie(Platform::Qq), Some("uin=1"));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.sync.default_interval, Duration::from_secs(360 * 60));
    }
}

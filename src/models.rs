use std::fmt;
use std::str::FromStr;

use color_eyre::eyre::{Report, eyre};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A source platform tracks are listed on and downloaded from.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// NetEase Cloud Music
    #[sea_orm(string_value = "netease")]
    #[serde(alias = "ncm")]
    #[value(alias = "ncm")]
    Netease,
    /// QQ Music
    #[sea_orm(string_value = "qq")]
    Qq,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Netease => "netease",
            Platform::Qq => "qq",
        }
    }

    /// Path segment and header prefix used by the relay service.
    pub fn relay_segment(&self) -> &'static str {
        match self {
            Platform::Netease => "ncm",
            Platform::Qq => "qq",
        }
    }

    /// Header carrying the platform session cookie on relay requests.
    pub fn relay_cookie_header(&self) -> &'static str {
        match self {
            Platform::Netease => "X-NCM-Cookie",
            Platform::Qq => "X-QQ-Cookie",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "netease" | "ncm" | "163" => Ok(Platform::Netease),
            "qq" | "qqmusic" | "tencent" => Ok(Platform::Qq),
            other => Err(eyre!("Unknown platform: {}", other)),
        }
    }
}

/// Audio quality levels, declared lowest to highest.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[sea_orm(string_value = "standard")]
    Standard,
    #[sea_orm(string_value = "higher")]
    Higher,
    #[sea_orm(string_value = "exhigh")]
    Exhigh,
    #[sea_orm(string_value = "lossless")]
    Lossless,
    #[sea_orm(string_value = "hires")]
    Hires,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Standard,
        QualityTier::Higher,
        QualityTier::Exhigh,
        QualityTier::Lossless,
        QualityTier::Hires,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Standard => "standard",
            QualityTier::Higher => "higher",
            QualityTier::Exhigh => "exhigh",
            QualityTier::Lossless => "lossless",
            QualityTier::Hires => "hires",
        }
    }

    /// Bitrate requested from NetEase for this tier.
    pub fn bitrate(&self) -> u32 {
        match self {
            QualityTier::Standard => 128_000,
            QualityTier::Higher => 192_000,
            QualityTier::Exhigh => 320_000,
            QualityTier::Lossless | QualityTier::Hires => 999_000,
        }
    }

    /// Lowest delivered bitrate still counted as this tier. NetEase silently
    /// downgrades instead of refusing, so anything below is "unavailable".
    pub fn min_bitrate(&self) -> u32 {
        match self {
            QualityTier::Standard => 0,
            QualityTier::Higher => 192_000,
            QualityTier::Exhigh => 320_000,
            QualityTier::Lossless | QualityTier::Hires => 400_000,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| eyre!("Unknown quality tier: {}", s))
    }
}

/// A track as listed by a source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Id of the track on its source platform
    pub id: String,
    pub title: String,
    /// Artist names joined with `/`
    pub artist: String,
    pub album: String,
    pub duration_ms: Option<u64>,
    pub platform: Platform,
}

/// Identity of a download job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub platform: Platform,
    pub track_id: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parsing_accepts_aliases() {
        assert_eq!("ncm".parse::<Platform>().unwrap(), Platform::Netease);
        assert_eq!("NetEase".parse::<Platform>().unwrap(), Platform::Netease);
        assert_eq!("qq".parse::<Platform>().unwrap(), Platform::Qq);
        assert!("spotify".parse::<Platform>().is_err());
    }

    #[test]
    fn test_quality_tiers_are_ordered() {
        assert!(QualityTier::Hires > QualityTier::Lossless);
        assert!(QualityTier::Exhigh > QualityTier::Higher);
        assert_eq!("exhigh".parse::<QualityTier>().unwrap(), QualityTier::Exhigh);
    }
}

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};

/// One audio item of the destination library catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
}

/// Port trait for the destination media library.
///
/// Implementations live in `services::library::emby` (production) or test mocks.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Every audio item currently indexed by the library.
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>>;

    /// Ask the library to rescan its folders for new files.
    async fn trigger_rescan(&self) -> Result<()>;
}

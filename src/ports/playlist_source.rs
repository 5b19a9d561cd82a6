use color_eyre::eyre::Result;

use crate::models::{Platform, Track};

#[derive(Debug, Clone)]
pub struct SourcePlaylist {
    pub name: String,
    pub tracks: Vec<Track>,
}

/// Port trait for reading a playlist from a source platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PlaylistSource: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch_playlist(&self, playlist_id: &str) -> Result<SourcePlaylist>;
}

pub mod cache;
pub mod emby;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use color_eyre::eyre::{Result, WrapErr};
use tracing::instrument;

use crate::ports::library::MediaLibrary;
use snapshot::LibrarySnapshot;

/// Publishes library snapshots.
///
/// Readers clone the current `Arc` and keep a consistent view for as long as they
/// hold it. A refresh builds the next snapshot off to the side and swaps the pointer;
/// a failed refresh leaves the current snapshot in place.
pub struct LibrarySnapshotStore {
    library: Arc<dyn MediaLibrary>,
    current: RwLock<Arc<LibrarySnapshot>>,
    /// Serializes refreshes so versions are published in order
    refresh_lock: tokio::sync::Mutex<()>,
    cache_path: Option<PathBuf>,
}

impl LibrarySnapshotStore {
    pub fn new(library: Arc<dyn MediaLibrary>, cache_path: Option<PathBuf>) -> Self {
        let initial = match cache_path.as_deref().map(cache::load) {
            Some(Ok(Some(snapshot))) => {
                tracing::info!(
                    "Loaded library cache: {} tracks (version {})",
                    snapshot.len(),
                    snapshot.version()
                );
                snapshot
            }
            Some(Err(e)) => {
                tracing::warn!("Ignoring unreadable library cache: {:#}", e);
                LibrarySnapshot::empty()
            }
            _ => LibrarySnapshot::empty(),
        };

        Self {
            library,
            current: RwLock::new(Arc::new(initial)),
            refresh_lock: tokio::sync::Mutex::new(()),
            cache_path,
        }
    }

    /// Latest published snapshot. Never waits for a refresh in progress.
    pub fn current(&self) -> Arc<LibrarySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Arc<LibrarySnapshot>> {
        let _guard = self.refresh_lock.lock().await;

        let catalog = self
            .library
            .fetch_catalog()
            .await
            .wrap_err("Failed to fetch library catalog")?;

        let version = self.current().version() + 1;
        let next = Arc::new(LibrarySnapshot::build(version, Utc::now(), catalog));

        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::clone(&next);
        }
        tracing::info!(
            "Published library snapshot version {} with {} tracks",
            version,
            next.len()
        );

        if let Some(path) = &self.cache_path
            && let Err(e) = cache::save(path, &next).await
        {
            tracing::warn!("Failed to save library cache: {:#}", e);
        }

        Ok(next)
    }

    pub async fn trigger_rescan(&self) -> Result<()> {
        self.library
            .trigger_rescan()
            .await
            .wrap_err("Failed to trigger library rescan")
    }
}

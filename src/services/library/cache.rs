use std::path::Path;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use super::snapshot::LibrarySnapshot;
use crate::ports::library::CatalogEntry;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u64,
    captured_at: DateTime<Utc>,
    entries: Vec<CatalogEntry>,
}

/// Read a previously saved snapshot. `Ok(None)` when no cache exists yet.
pub fn load(path: &Path) -> Result<Option<LibrarySnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read library cache {}", path.display()))?;
    let cache: CacheFile = serde_json::from_str(&contents)
        .wrap_err_with(|| format!("Failed to parse library cache {}", path.display()))?;
    Ok(Some(LibrarySnapshot::build(
        cache.version,
        cache.captured_at,
        cache.entries,
    )))
}

/// Persist a snapshot; written to a sibling temp file first so a crash never leaves
/// a truncated cache behind.
pub async fn save(path: &Path, snapshot: &LibrarySnapshot) -> Result<()> {
    let cache = CacheFile {
        version: snapshot.version(),
        captured_at: snapshot.captured_at(),
        entries: snapshot.catalog(),
    };
    let body = serde_json::to_vec(&cache).wrap_err("Failed to serialize library cache")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .wrap_err("Failed to create library cache directory")?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .wrap_err_with(|| format!("Failed to write library cache {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .wrap_err("Failed to move library cache into place")?;
    Ok(())
}

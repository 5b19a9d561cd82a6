use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::ports::library::CatalogEntry;
use crate::services::matching::normalize;

/// A catalog entry with its canonical forms computed once at build time.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub entry: CatalogEntry,
    pub title: String,
    pub title_key: String,
    pub artists: BTreeSet<String>,
    pub key: String,
}

impl SnapshotEntry {
    fn new(entry: CatalogEntry) -> Self {
        Self {
            title: normalize::canonicalize(&entry.title),
            title_key: normalize::title_lookup_key(&entry.title),
            artists: normalize::artist_set(&entry.artist),
            key: normalize::track_key(&entry.title, &entry.artist),
            entry,
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }
}

/// Immutable, versioned view of the destination library.
///
/// Built wholesale and never mutated; the store swaps whole snapshots.
#[derive(Debug)]
pub struct LibrarySnapshot {
    version: u64,
    captured_at: DateTime<Utc>,
    /// Sorted by id, which makes every index below list ids in ascending order
    entries: Vec<SnapshotEntry>,
    by_key: HashMap<String, Vec<usize>>,
    by_title: HashMap<String, Vec<usize>>,
}

impl LibrarySnapshot {
    pub fn empty() -> Self {
        Self::build(0, Utc::now(), Vec::new())
    }

    pub fn build(version: u64, captured_at: DateTime<Utc>, catalog: Vec<CatalogEntry>) -> Self {
        let mut entries: Vec<SnapshotEntry> = catalog.into_iter().map(SnapshotEntry::new).collect();
        entries.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));

        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_title: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            by_key.entry(entry.key.clone()).or_default().push(index);
            if !entry.title_key.is_empty() {
                by_title
                    .entry(entry.title_key.clone())
                    .or_default()
                    .push(index);
            }
        }

        Self {
            version,
            captured_at,
            entries,
            by_key,
            by_title,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// False for the placeholder published before any catalog was fetched or
    /// read from cache.
    pub fn is_loaded(&self) -> bool {
        self.version > 0
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Entry stored under exactly this (title, artist) key, lowest id first.
    pub fn exact(&self, key: &str) -> Option<&SnapshotEntry> {
        self.by_key
            .get(key)
            .and_then(|indexes| indexes.first())
            .map(|&index| &self.entries[index])
    }

    /// Entries whose title, without bracketed qualifiers, equals `title_key`.
    pub fn with_title_key(&self, title_key: &str) -> Vec<&SnapshotEntry> {
        self.by_title
            .get(title_key)
            .map(|indexes| indexes.iter().map(|&index| &self.entries[index]).collect())
            .unwrap_or_default()
    }

    /// Raw catalog, for the on-disk cache.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.entries.iter().map(|e| e.entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, title: &str, artist: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: String::new(),
        }
    }

    #[test]
    fn test_exact_lookup_prefers_lowest_id() {
        let snapshot = LibrarySnapshot::build(
            3,
            Utc::now(),
            vec![entry("L9", "晴天", "周杰伦"), entry("L1", "晴天", "周杰伦")],
        );
        let key = normalize::track_key("晴天", "周杰伦");
        assert_eq!(snapshot.exact(&key).unwrap().id(), "L1");
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_title_bucket_ignores_qualifiers() {
        let snapshot = LibrarySnapshot::build(
            1,
            Utc::now(),
            vec![entry("a", "晴天 (Live)", "周杰伦"), entry("b", "七里香", "周杰伦")],
        );
        let bucket = snapshot.with_title_key(&normalize::title_lookup_key("晴天"));
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].id(), "a");
    }
}

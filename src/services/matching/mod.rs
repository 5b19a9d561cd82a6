//! Decides whether a requested track already exists in the destination library.
//!
//! `Matcher::match_track` is a pure function of the track, the snapshot and the
//! configured thresholds.

pub mod normalize;
pub mod similarity;

use serde::Serialize;

use crate::config::MatchingConfig;
use crate::models::Track;
use crate::services::library::snapshot::{LibrarySnapshot, SnapshotEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Present,
    Missing,
    /// Needs a human decision; never auto-enqueued
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub track: Track,
    pub outcome: MatchOutcome,
    /// Destination id, only when `Present`
    pub library_id: Option<String>,
    /// Best-scoring entry regardless of outcome, for review
    pub best_candidate: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Matcher {
    present_threshold: f64,
    ambiguous_threshold: f64,
    title_weight: f64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(&MatchingConfig::default())
    }
}

impl Matcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            present_threshold: config.present_threshold,
            ambiguous_threshold: config.ambiguous_threshold,
            title_weight: config.title_weight,
        }
    }

    pub fn match_track(&self, track: &Track, snapshot: &LibrarySnapshot) -> MatchResult {
        let key = normalize::track_key(&track.title, &track.artist);
        if let Some(exact) = snapshot.exact(&key) {
            return self.result(track, Some((exact.id().to_string(), 1.0)));
        }

        let title = normalize::canonicalize(&track.title);
        let title_key = normalize::title_lookup_key(&track.title);
        let artists = normalize::artist_set(&track.artist);

        let bucket = snapshot.with_title_key(&title_key);
        let candidates: Box<dyn Iterator<Item = &SnapshotEntry>> = if bucket.is_empty() {
            Box::new(snapshot.entries().iter())
        } else {
            Box::new(bucket.into_iter())
        };

        let mut best: Option<(String, f64)> = None;
        for candidate in candidates {
            let title_score = similarity::string_similarity(&title, &candidate.title);
            let artist_score = similarity::artist_similarity(&artists, &candidate.artists);
            let score =
                self.title_weight * title_score + (1.0 - self.title_weight) * artist_score;

            // Candidates arrive in ascending id order, so strict comparison keeps the
            // lexicographically smallest id among equal scores.
            let better = match &best {
                None => true,
                Some((best_id, best_score)) => {
                    score > *best_score || (score == *best_score && candidate.id() < best_id.as_str())
                }
            };
            if better {
                best = Some((candidate.id().to_string(), score));
            }
        }

        self.result(track, best)
    }

    fn result(&self, track: &Track, best: Option<(String, f64)>) -> MatchResult {
        let (best_candidate, score) = match best {
            Some((id, score)) => (Some(id), score),
            None => (None, 0.0),
        };
        let outcome = if best_candidate.is_some() && score >= self.present_threshold {
            MatchOutcome::Present
        } else if best_candidate.is_some() && score >= self.ambiguous_threshold {
            MatchOutcome::Ambiguous
        } else {
            MatchOutcome::Missing
        };

        MatchResult {
            track: track.clone(),
            outcome,
            library_id: (outcome == MatchOutcome::Present)
                .then(|| best_candidate.clone())
                .flatten(),
            best_candidate,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::Platform;
    use crate::ports::library::CatalogEntry;

    fn track(title: &str, artist: &str) -> Track {
        Track {
            id: "t1".into(),
            title: title.into(),
            artist: artist.into(),
            album: String::new(),
            duration_ms: None,
            platform: Platform::Netease,
        }
    }

    fn snapshot(entries: &[(&str, &str, &str)]) -> LibrarySnapshot {
        LibrarySnapshot::build(
            1,
            Utc::now(),
            entries
                .iter()
                .map(|(id, title, artist)| CatalogEntry {
                    id: id.to_string(),
                    title: title.to_string(),
                    artist: artist.to_string(),
                    album: String::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_exact_key_is_present_with_full_score() {
        let snapshot = snapshot(&[("L1", "晴天", "周杰伦")]);
        let result = Matcher::default().match_track(&track("晴天", "周杰伦"), &snapshot);
        assert_eq!(result.outcome, MatchOutcome::Present);
        assert_eq!(result.library_id.as_deref(), Some("L1"));
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_bracketed_qualifier_still_present() {
        let snapshot = snapshot(&[("L1", "告白气球 (Live)", "周杰伦")]);
        let result = Matcher::default().match_track(&track("告白气球", "周杰伦"), &snapshot);
        assert_eq!(result.outcome, MatchOutcome::Present);
        assert_eq!(result.library_id.as_deref(), Some("L1"));
    }

    #[test]
    fn test_same_title_other_artist_is_ambiguous() {
        let snapshot = snapshot(&[("L1", "Hello", "Adele")]);
        let result = Matcher::default().match_track(&track("Hello", "Lionel Richie"), &snapshot);
        assert_eq!(result.outcome, MatchOutcome::Ambiguous);
        assert_eq!(result.library_id, None);
        assert_eq!(result.best_candidate.as_deref(), Some("L1"));
    }

    #[test]
    fn test_unrelated_track_is_missing() {
        let snapshot = snapshot(&[("L1", "七里香", "周杰伦"), ("L2", "Yellow", "Coldplay")]);
        let result = Matcher::default().match_track(&track("稻香", "陈奕迅"), &snapshot);
        assert_eq!(result.outcome, MatchOutcome::Missing);
        assert_eq!(result.library_id, None);
    }

    #[test]
    fn test_empty_snapshot_is_missing() {
        let result = Matcher::default().match_track(&track("晴天", "周杰伦"), &LibrarySnapshot::empty());
        assert_eq!(result.outcome, MatchOutcome::Missing);
        assert_eq!(result.best_candidate, None);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_ties_break_on_lowest_id() {
        let snapshot = snapshot(&[("L7", "Song (Live)", "A"), ("L3", "Song (Demo)", "A")]);
        let result = Matcher::default().match_track(&track("Song", "A"), &snapshot);
        assert_eq!(result.best_candidate.as_deref(), Some("L3"));
    }

    #[test]
    fn test_matching_is_deterministic() {
        let snapshot = snapshot(&[
            ("L1", "Faded", "Alan Walker"),
            ("L2", "Fade", "Alan Walker"),
            ("L3", "Faded (Remix)", "Alan Walker"),
        ]);
        let matcher = Matcher::default();
        let first = matcher.match_track(&track("Faded", "Alan Walker feat. Iselin"), &snapshot);
        for _ in 0..10 {
            assert_eq!(
                matcher.match_track(&track("Faded", "Alan Walker feat. Iselin"), &snapshot),
                first
            );
        }
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let strict = Matcher::new(&MatchingConfig {
            present_threshold: 0.99,
            ambiguous_threshold: 0.5,
            title_weight: 2.0 / 3.0,
        });
        let snapshot = snapshot(&[("L1", "告白气球 (Live)", "周杰伦")]);
        let result = strict.match_track(&track("告白气球", "周杰伦"), &snapshot);
        assert_eq!(result.outcome, MatchOutcome::Ambiguous);
    }
}

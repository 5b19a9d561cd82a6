//! Canonical forms of titles and artist credits.
//!
//! Every key the library snapshot stores and every lookup the matcher performs goes
//! through these functions, so both sides always agree on what "the same" means.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

/// Words that join several artists in one credit ("A feat. B", "A vs B").
const ARTIST_JOINERS: &[&str] = &["feat", "ft", "with", "vs", "presents", "pres", "starring"];

/// Characters that separate artists outright.
const ARTIST_SEPARATORS: &[char] = &['/', '•', ',', '、', '&', '，'];

/// Normalize a string for comparison
///
/// Applies: NFKC normalization, accent folding, lowercase, punctuation removal,
/// whitespace collapse
pub fn canonicalize(s: &str) -> String {
    let normalized: String = s.nfkc().collect();
    let folded = unaccent::unaccent(&normalized);

    folded
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                Some(c)
            } else if c == '\'' || c == '’' {
                // don't -> dont
                None
            } else {
                Some(' ')
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn closing_for(c: char) -> Option<char> {
    match c {
        '(' => Some(')'),
        '（' => Some('）'),
        '[' => Some(']'),
        '【' => Some('】'),
        _ => None,
    }
}

/// Remove bracketed qualifiers such as "(Live)", "（伴奏）", "[Remix]" or "【MV】".
///
/// An unclosed bracket keeps its text so a stray "(" never swallows the title.
pub fn strip_brackets(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut stack: Vec<(char, usize)> = Vec::new();

    for c in s.chars() {
        if let Some(close) = closing_for(c) {
            stack.push((close, result.len()));
            result.push(c);
        } else if let Some(&(close, start)) = stack.last()
            && c == close
        {
            stack.pop();
            result.truncate(start);
        } else {
            result.push(c);
        }
    }

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key used to bucket candidates: the title without qualifiers.
pub fn title_lookup_key(title: &str) -> String {
    canonicalize(&strip_brackets(title))
}

/// Split an artist credit into canonical individual names.
pub fn artist_set(artist: &str) -> BTreeSet<String> {
    let stripped = strip_brackets(&artist.to_lowercase());
    let mut names = BTreeSet::new();

    for segment in stripped.split(ARTIST_SEPARATORS) {
        let mut current: Vec<&str> = Vec::new();
        for word in segment.split_whitespace() {
            let bare = word.trim_end_matches('.');
            if !current.is_empty() && ARTIST_JOINERS.contains(&bare) {
                names.insert(canonicalize(&current.join(" ")));
                current.clear();
            } else {
                current.push(word);
            }
        }
        if !current.is_empty() {
            names.insert(canonicalize(&current.join(" ")));
        }
    }

    names.retain(|name| !name.is_empty());
    names
}

/// Canonical form of a whole artist credit; order of the credited names is irrelevant.
pub fn artist_key(artist: &str) -> String {
    artist_set(artist).into_iter().collect::<Vec<_>>().join("/")
}

/// Exact-match key of a (title, artist) pair.
pub fn track_key(title: &str, artist: &str) -> String {
    format!("{}\u{1f}{}", canonicalize(title), artist_key(artist))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("Hello, World!"), "hello world");
        assert_eq!(canonicalize("  Don't   Stop  "), "dont stop");
        assert_eq!(canonicalize("Beyoncé"), "beyonce");
        assert_eq!(canonicalize("晴天"), "晴天");
    }

    #[test]
    fn test_canonicalize_full_width() {
        // NFKC folds full-width forms
        assert_eq!(canonicalize("ＡＢＣ１２３"), "abc123");
        assert_eq!(canonicalize("告白气球！"), "告白气球");
    }

    #[test]
    fn test_strip_brackets() {
        assert_eq!(strip_brackets("晴天 (Live)"), "晴天");
        assert_eq!(strip_brackets("稻香（伴奏）"), "稻香");
        assert_eq!(strip_brackets("Song [Remix] (feat. X)"), "Song");
        assert_eq!(strip_brackets("【MV】Title"), "Title");
        assert_eq!(strip_brackets("Outer (inner (nested) more) tail"), "Outer tail");
        assert_eq!(strip_brackets("Broken (open"), "Broken (open");
    }

    #[test]
    fn test_artist_set_splits_credits() {
        let expected: BTreeSet<String> =
            ["周杰伦", "费玉清"].iter().map(|s| s.to_string()).collect();
        assert_eq!(artist_set("周杰伦/费玉清"), expected);
        assert_eq!(artist_set("费玉清 & 周杰伦"), expected);
        assert_eq!(artist_set("周杰伦、费玉清"), expected);

        let feat = artist_set("Calvin Harris feat. Rihanna (Official)");
        assert!(feat.contains("calvin harris"));
        assert!(feat.contains("rihanna"));
        assert_eq!(feat.len(), 2);
    }

    #[test]
    fn test_track_key_ignores_credit_order() {
        assert_eq!(
            track_key("Faded", "Alan Walker, Iselin Solheim"),
            track_key("FADED", "Iselin Solheim / Alan Walker")
        );
        assert_ne!(track_key("Faded", "Alan Walker"), track_key("Faded", "Someone Else"));
    }
}

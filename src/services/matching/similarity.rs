use std::collections::{BTreeSet, HashSet};

/// Token-based similarity - handles word reordering
///
/// "The Quick Brown Fox" vs "Quick Brown Fox, The" will score highly
pub fn token_similarity(s1: &str, s2: &str) -> f64 {
    let tokens1: HashSet<&str> = s1.split_whitespace().collect();
    let tokens2: HashSet<&str> = s2.split_whitespace().collect();

    if tokens1.is_empty() && tokens2.is_empty() {
        return 1.0;
    }
    if tokens1.is_empty() || tokens2.is_empty() {
        return 0.0;
    }

    let intersection = tokens1.intersection(&tokens2).count();
    let union = tokens1.union(&tokens2).count();

    intersection as f64 / union as f64
}

/// Combined similarity using both Jaro-Winkler and token-based
pub fn string_similarity(s1: &str, s2: &str) -> f64 {
    if s1 == s2 {
        return 1.0;
    }
    if s1.is_empty() || s2.is_empty() {
        return 0.0;
    }
    let jw = jaro_winkler::jaro_winkler(s1, s2);
    let token = token_similarity(s1, s2);

    // Slight preference for character-level agreement
    jw.max(token * 0.95)
}

/// Compare two artist credits by their sets of individual names.
pub fn artist_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.5;
    }
    if a == b {
        return 1.0;
    }
    if a.is_subset(b) || b.is_subset(a) {
        return 0.8;
    }
    if a.intersection(b).next().is_some() {
        return 0.4;
    }
    let joined_a = a.iter().cloned().collect::<Vec<_>>().join(" ");
    let joined_b = b.iter().cloned().collect::<Vec<_>>().join(" ");
    string_similarity(&joined_a, &joined_b) * 0.5
}

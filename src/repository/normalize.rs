//! Canonical lookup keys.
//! Primary key: trimmed, lower-cased, whitespace-collapsed source text.
//! Phrase lookups fall back to an apostrophe-stripped key, then a
//! punctuation-stripped "words-only" key; fallbacks are never stored.

use std::sync::OnceLock;

use regex::Regex;

const APOSTROPHES: [char; 4] = ['\'', '\u{2019}', '\u{2018}', '`'];

fn language_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{2}-[a-z]{2}$").expect("static pattern"))
}

/// "en-ru" style pair of ISO-639-1 codes.
pub fn is_valid_language_pair(pair: &str) -> bool {
    language_pair_pattern().is_match(pair)
}

/// Collapse every whitespace run to a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim, lowercase, collapse whitespace.
pub fn canonical_key(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
}

/// Canonical key with apostrophes removed ("don't" → "dont").
pub fn strip_apostrophes(key: &str) -> String {
    key.chars().filter(|c| !APOSTROPHES.contains(c)).collect()
}

/// Canonical key with punctuation replaced by spaces, then re-collapsed.
pub fn words_only(key: &str) -> String {
    let spaced: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    collapse_whitespace(&spaced)
}

/// Keys to try, primary first. With `fallbacks`, the apostrophe-stripped and
/// words-only variants follow when they differ from what came before.
pub fn lookup_keys(text: &str, fallbacks: bool) -> Vec<String> {
    let primary = canonical_key(text);
    let mut keys = vec![primary.clone()];
    if fallbacks {
        for candidate in [strip_apostrophes(&primary), words_only(&strip_apostrophes(&primary))] {
            if !candidate.is_empty() && !keys.contains(&candidate) {
                keys.push(candidate);
            }
        }
    }
    keys
}

//! Longest-match phrase substitution.
//! Windows of 2..=max_words tokens are looked up longest first; a hit replaces
//! the whole window and scanning resumes after it. Single words are left to
//! the dictionary layer.

use std::sync::Arc;

use crate::error::LayerError;
use crate::layer::{Layer, LayerDebugInfo, LayerOutput, LayerType, TranslationContext};
use crate::repository::normalize::is_valid_language_pair;
use crate::repository::record::PhraseEntry;
use crate::repository::Repository;

use super::{match_case, split_affixes};

pub const DEFAULT_MAX_PHRASE_WORDS: usize = 6;

pub struct PhraseLookupLayer {
    phrases: Arc<Repository<PhraseEntry>>,
    max_words: usize,
}

impl PhraseLookupLayer {
    pub fn new(phrases: Arc<Repository<PhraseEntry>>) -> Self {
        Self {
            phrases,
            max_words: DEFAULT_MAX_PHRASE_WORDS,
        }
    }

    pub fn with_max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words.max(2);
        self
    }
}

impl Layer for PhraseLookupLayer {
    fn name(&self) -> &str {
        "phrase_lookup"
    }

    fn description(&self) -> &str {
        "longest-match multi-word phrase replacement"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::PhraseLookup
    }

    fn can_handle(&self, text: &str, context: &TranslationContext) -> bool {
        is_valid_language_pair(&context.language_pair()) && text.split_whitespace().nth(1).is_some()
    }

    fn process(&self, text: &str, context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        let pair = context.language_pair();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut debug = LayerDebugInfo {
            items_processed: tokens.len(),
            ..Default::default()
        };
        let mut out: Vec<String> = Vec::with_capacity(tokens.len());
        let mut matched_phrases = 0u64;

        let mut i = 0;
        while i < tokens.len() {
            let longest = self.max_words.min(tokens.len() - i);
            let mut replaced = false;
            for len in (2..=longest).rev() {
                let window = &tokens[i..i + len];
                let candidate = window.join(" ");
                let lookup = self.phrases.lookup(&candidate, &pair)?;
                if lookup.cache_hit {
                    debug.cache_hits += 1;
                } else {
                    debug.cache_misses += 1;
                }
                if let Some(phrase) = lookup.record {
                    let (lead, first, _) = split_affixes(window[0]);
                    let (_, _, trail) = split_affixes(window[len - 1]);
                    out.push(format!(
                        "{lead}{}{trail}",
                        match_case(first, &phrase.target_phrase)
                    ));
                    debug.modifications += len;
                    matched_phrases += 1;
                    i += len;
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                out.push(tokens[i].to_string());
                i += 1;
            }
        }

        debug
            .additional_info
            .insert("matched_phrases".into(), matched_phrases.into());
        Ok(LayerOutput::new(out.join(" "), debug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSection;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn layer(dir: &TempDir) -> PhraseLookupLayer {
        let repo: Arc<Repository<PhraseEntry>> =
            Repository::open(Storage::new(dir.path(), &StorageSection::default()), None, None);
        repo.bulk_upsert(vec![
            PhraseEntry::new("good morning", "dobroe utro", "en-ru", 95.0),
            PhraseEntry::new("good morning everyone", "vsem dobroe utro", "en-ru", 90.0),
            PhraseEntry::new("thank you", "spasibo", "en-ru", 99.0),
        ])
        .unwrap();
        PhraseLookupLayer::new(repo)
    }

    #[test]
    fn longest_match_wins_and_punctuation_is_kept() {
        let dir = TempDir::new().unwrap();
        let layer = layer(&dir);
        let ctx = TranslationContext::new("en", "ru");
        let out = layer
            .process("Good morning everyone, thank you!", &ctx)
            .unwrap();
        assert_eq!(out.processed_text, "Vsem dobroe utro, spasibo!");
        assert_eq!(out.debug.items_processed, 5);
        assert_eq!(out.debug.modifications, 5);
        assert_eq!(out.debug.additional_info["matched_phrases"], serde_json::json!(2));
        assert_eq!(layer.description(), "longest-match multi-word phrase replacement");
    }

    #[test]
    fn unmatched_text_passes_through() {
        let dir = TempDir::new().unwrap();
        let layer = layer(&dir);
        let ctx = TranslationContext::new("en", "ru");
        let out = layer.process("nothing to see", &ctx).unwrap();
        assert_eq!(out.processed_text, "nothing to see");
        assert_eq!(out.debug.modifications, 0);
        assert!(out.debug.cache_misses > 0);
        assert!(!layer.can_handle("single", &ctx));
    }

    #[test]
    fn window_is_capped_by_max_words() {
        let dir = TempDir::new().unwrap();
        let layer = layer(&dir).with_max_words(2);
        let out = layer
            .process("good morning everyone", &TranslationContext::new("en", "ru"))
            .unwrap();
        // the three-word phrase is out of reach; the two-word one still matches
        assert_eq!(out.processed_text, "dobroe utro everyone");
    }
}

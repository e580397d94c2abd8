//! Per-token dictionary substitution. Surrounding punctuation and an initial
//! capital survive the replacement.

use std::sync::Arc;

use crate::error::LayerError;
use crate::layer::{Layer, LayerDebugInfo, LayerOutput, LayerType, TranslationContext};
use crate::repository::normalize::is_valid_language_pair;
use crate::repository::record::DictionaryEntry;
use crate::repository::Repository;

use super::{match_case, split_affixes};

pub struct DictionaryLayer {
    dictionary: Arc<Repository<DictionaryEntry>>,
}

impl DictionaryLayer {
    pub fn new(dictionary: Arc<Repository<DictionaryEntry>>) -> Self {
        Self { dictionary }
    }
}

impl Layer for DictionaryLayer {
    fn name(&self) -> &str {
        "dictionary"
    }

    fn description(&self) -> &str {
        "word-by-word dictionary substitution"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Dictionary
    }

    fn can_handle(&self, text: &str, context: &TranslationContext) -> bool {
        is_valid_language_pair(&context.language_pair()) && text.chars().any(char::is_alphanumeric)
    }

    fn process(&self, text: &str, context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        let pair = context.language_pair();
        let mut debug = LayerDebugInfo::default();
        let mut out: Vec<String> = Vec::new();

        for token in text.split_whitespace() {
            let (lead, word, trail) = split_affixes(token);
            if word.is_empty() {
                out.push(token.to_string());
                continue;
            }
            debug.items_processed += 1;
            let lookup = self.dictionary.lookup(word, &pair)?;
            if lookup.cache_hit {
                debug.cache_hits += 1;
            } else {
                debug.cache_misses += 1;
            }
            match lookup.record {
                Some(entry) => {
                    debug.modifications += 1;
                    out.push(format!("{lead}{}{trail}", match_case(word, &entry.target_word)));
                }
                None => out.push(token.to_string()),
            }
        }

        Ok(LayerOutput::new(out.join(" "), debug))
    }
}

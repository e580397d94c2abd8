//! Regex substitution over one rule file (grammar, word order, or
//! post-processing). Rules apply in ascending priority; compiled patterns are
//! kept in a small LRU since the pattern text itself is the cache key.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

use crate::error::LayerError;
use crate::layer::{Layer, LayerDebugInfo, LayerOutput, LayerType, TranslationContext};
use crate::repository::normalize::is_valid_language_pair;
use crate::repository::record::{AsRule, Record, RuleKind};
use crate::repository::Repository;

const COMPILED_CAPACITY: usize = 512;

pub struct RuleLayer<R: Record + AsRule> {
    rules: Arc<Repository<R>>,
    compiled: Mutex<LruCache<String, Regex>>,
}

impl<R: Record + AsRule> RuleLayer<R> {
    pub fn new(rules: Arc<Repository<R>>) -> Self {
        Self {
            rules,
            compiled: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMPILED_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn regex(&self, pattern: &str) -> Result<Regex, LayerError> {
        let mut compiled = self.compiled.lock();
        if let Some(regex) = compiled.get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern)
            .map_err(|e| LayerError::Data(format!("rule `{pattern}` does not compile: {e}")))?;
        compiled.put(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

impl<R: Record + AsRule> Layer for RuleLayer<R> {
    fn name(&self) -> &str {
        R::KIND
    }

    fn description(&self) -> &str {
        match R::RULE_KIND {
            RuleKind::Grammar => "regex grammar corrections",
            RuleKind::WordOrder => "regex word order rearrangement",
            RuleKind::PostProcessing => "regex output cleanup",
        }
    }

    fn layer_type(&self) -> LayerType {
        match R::RULE_KIND {
            RuleKind::Grammar => LayerType::Grammar,
            RuleKind::WordOrder => LayerType::WordOrder,
            RuleKind::PostProcessing => LayerType::PostProcessing,
        }
    }

    fn can_handle(&self, text: &str, context: &TranslationContext) -> bool {
        !text.trim().is_empty() && is_valid_language_pair(&context.language_pair())
    }

    fn process(&self, text: &str, context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        let rules = self.rules.rules(&context.language_pair())?;
        let mut debug = LayerDebugInfo {
            items_processed: rules.len(),
            ..Default::default()
        };
        let mut current = text.to_string();
        for rule in &rules {
            let rule = rule.rule();
            let regex = self.regex(&rule.pattern)?;
            let hits = regex.find_iter(&current).count();
            if hits == 0 {
                continue;
            }
            current = regex
                .replace_all(&current, rule.replacement.as_str())
                .into_owned();
            debug.modifications += 1;
        }
        Ok(LayerOutput::new(current, debug))
    }
}

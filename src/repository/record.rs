//! Persisted record types and the `Record` trait that lets one repository
//! implementation serve dictionary, phrase, and rule files.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::normalize::{canonical_key, collapse_whitespace, is_valid_language_pair};
use crate::cache::{CacheManager, CacheWeight, TtlLruCache, ENTRY_OVERHEAD_BYTES};
use crate::error::ValidationError;

/// Current time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn default_frequency() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

fn require_language_pair(pair: &str) -> Result<(), ValidationError> {
    if !is_valid_language_pair(pair) {
        return Err(ValidationError::new(
            "language_pair",
            format!("`{pair}` does not match ^[a-z]{{2}}-[a-z]{{2}}$"),
        ));
    }
    Ok(())
}

fn stamp(created_at: &mut i64, updated_at: &mut i64, now_ms: i64) {
    if *created_at <= 0 {
        *created_at = now_ms;
    }
    if *updated_at < *created_at {
        *updated_at = *created_at;
    }
}

fn opt_weight(value: &Option<String>) -> usize {
    value.as_ref().map(|s| s.len() * 2).unwrap_or(0)
}

/// A record stored one-per-line in a per-language-pair JSONL file.
pub trait Record: Clone + Serialize + DeserializeOwned + CacheWeight + Send + Sync + 'static {
    /// File name under `<dataRoot>/<lang-pair>/`.
    const FILE_NAME: &'static str;
    /// Repository name used for memory accounting and logs.
    const KIND: &'static str;
    /// Lookups also try apostrophe-stripped and words-only keys.
    const FALLBACK_KEYS: bool = false;

    fn source(&self) -> &str;

    fn language_pair(&self) -> &str;

    /// Check required fields before anything is written.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Trim/lowercase/collapse and fill missing timestamps.
    fn normalize(&mut self, now_ms: i64);

    /// Fold `incoming` (same key) into `self`.
    fn merge(&mut self, incoming: Self);

    /// Index key for raw source text.
    fn key_for(source: &str) -> String {
        canonical_key(source)
    }

    fn key(&self) -> String {
        Self::key_for(self.source())
    }

    /// Approximate in-memory size for budget accounting.
    fn estimated_size(&self) -> usize {
        self.weight() + ENTRY_OVERHEAD_BYTES
    }

    /// The cache this record type is served from, if any.
    fn cache(_cache: &CacheManager) -> Option<&TtlLruCache<String, Self>> {
        None
    }
}

/// `dictionary.jsonl` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub source_word: String,
    pub target_word: String,
    pub language_pair: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_of_speech: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl DictionaryEntry {
    pub fn new(
        source_word: impl Into<String>,
        target_word: impl Into<String>,
        language_pair: impl Into<String>,
    ) -> Self {
        Self {
            source_word: source_word.into(),
            target_word: target_word.into(),
            language_pair: language_pair.into(),
            part_of_speech: None,
            definition: None,
            frequency: 1,
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl CacheWeight for DictionaryEntry {
    fn weight(&self) -> usize {
        (self.source_word.len() + self.target_word.len() + self.language_pair.len()) * 2
            + opt_weight(&self.part_of_speech)
            + opt_weight(&self.definition)
    }
}

impl Record for DictionaryEntry {
    const FILE_NAME: &'static str = "dictionary.jsonl";
    const KIND: &'static str = "dictionary";

    fn source(&self) -> &str {
        &self.source_word
    }

    fn language_pair(&self) -> &str {
        &self.language_pair
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("source_word", &self.source_word)?;
        require_non_empty("target_word", &self.target_word)?;
        require_language_pair(&self.language_pair)
    }

    fn normalize(&mut self, now_ms: i64) {
        self.source_word = canonical_key(&self.source_word);
        self.target_word = collapse_whitespace(&self.target_word);
        self.part_of_speech = self
            .part_of_speech
            .take()
            .map(|p| canonical_key(&p))
            .filter(|p| !p.is_empty());
        self.definition = self
            .definition
            .take()
            .map(|d| collapse_whitespace(&d))
            .filter(|d| !d.is_empty());
        stamp(&mut self.created_at, &mut self.updated_at, now_ms);
    }

    fn merge(&mut self, incoming: Self) {
        self.frequency = self.frequency.saturating_add(incoming.frequency);
        self.target_word = incoming.target_word;
        if incoming.part_of_speech.is_some() {
            self.part_of_speech = incoming.part_of_speech;
        }
        if incoming.definition.is_some() {
            self.definition = incoming.definition;
        }
        self.updated_at = self.updated_at.max(incoming.updated_at);
    }

    fn cache(cache: &CacheManager) -> Option<&TtlLruCache<String, Self>> {
        Some(cache.words())
    }
}

/// `phrases.jsonl` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseEntry {
    #[serde(alias = "source_word")]
    pub source_phrase: String,
    #[serde(alias = "target_word")]
    pub target_phrase: String,
    pub language_pair: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl PhraseEntry {
    pub fn new(
        source_phrase: impl Into<String>,
        target_phrase: impl Into<String>,
        language_pair: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            source_phrase: source_phrase.into(),
            target_phrase: target_phrase.into(),
            language_pair: language_pair.into(),
            category: None,
            context: None,
            confidence,
            frequency: 1,
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl CacheWeight for PhraseEntry {
    fn weight(&self) -> usize {
        (self.source_phrase.len() + self.target_phrase.len() + self.language_pair.len()) * 2
            + opt_weight(&self.category)
            + opt_weight(&self.context)
    }
}

impl Record for PhraseEntry {
    const FILE_NAME: &'static str = "phrases.jsonl";
    const KIND: &'static str = "phrases";
    const FALLBACK_KEYS: bool = true;

    fn source(&self) -> &str {
        &self.source_phrase
    }

    fn language_pair(&self) -> &str {
        &self.language_pair
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("source_phrase", &self.source_phrase)?;
        require_non_empty("target_phrase", &self.target_phrase)?;
        require_language_pair(&self.language_pair)?;
        if !(0.0..=100.0).contains(&self.confidence) {
            return Err(ValidationError::new(
                "confidence",
                format!("{} is outside [0, 100]", self.confidence),
            ));
        }
        Ok(())
    }

    fn normalize(&mut self, now_ms: i64) {
        self.source_phrase = canonical_key(&self.source_phrase);
        self.target_phrase = collapse_whitespace(&self.target_phrase);
        self.category = self
            .category
            .take()
            .map(|c| canonical_key(&c))
            .filter(|c| !c.is_empty());
        self.context = self
            .context
            .take()
            .map(|c| collapse_whitespace(&c))
            .filter(|c| !c.is_empty());
        stamp(&mut self.created_at, &mut self.updated_at, now_ms);
    }

    fn merge(&mut self, incoming: Self) {
        self.frequency = self.frequency.saturating_add(incoming.frequency);
        self.confidence = (self.confidence + incoming.confidence) / 2.0;
        self.target_phrase = incoming.target_phrase;
        if incoming.category.is_some() {
            self.category = incoming.category;
        }
        if incoming.context.is_some() {
            self.context = incoming.context;
        }
        self.updated_at = self.updated_at.max(incoming.updated_at);
    }

    fn cache(cache: &CacheManager) -> Option<&TtlLruCache<String, Self>> {
        Some(cache.phrases())
    }
}

/// Which rule file a `RuleRecord` lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Grammar,
    WordOrder,
    PostProcessing,
}

/// A regex substitution rule. Stored in `grammar_rules.jsonl`,
/// `word_order_rules.jsonl`, or `post_processing_rules.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub pattern: String,
    pub replacement: String,
    pub language_pair: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl RuleRecord {
    pub fn new(
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        language_pair: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
            language_pair: language_pair.into(),
            priority,
            description: None,
            enabled: true,
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl CacheWeight for RuleRecord {
    fn weight(&self) -> usize {
        (self.pattern.len() + self.replacement.len() + self.language_pair.len()) * 2
            + opt_weight(&self.description)
    }
}

/// Rule files share one record shape; the marker type picks the file.
macro_rules! rule_record {
    ($name:ident, $file:literal, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub RuleRecord);

        impl CacheWeight for $name {
            fn weight(&self) -> usize {
                self.0.weight()
            }
        }

        impl Record for $name {
            const FILE_NAME: &'static str = $file;
            const KIND: &'static str = $kind;

            fn source(&self) -> &str {
                &self.0.pattern
            }

            fn language_pair(&self) -> &str {
                &self.0.language_pair
            }

            fn validate(&self) -> Result<(), ValidationError> {
                self.0.validate()
            }

            fn normalize(&mut self, now_ms: i64) {
                self.0.normalize(now_ms)
            }

            fn merge(&mut self, incoming: Self) {
                self.0.merge(incoming.0)
            }

            /// Patterns are regexes; case and escapes are significant.
            fn key_for(source: &str) -> String {
                source.trim().to_string()
            }
        }

        impl From<RuleRecord> for $name {
            fn from(rule: RuleRecord) -> Self {
                $name(rule)
            }
        }
    };
}

rule_record!(GrammarRule, "grammar_rules.jsonl", "grammar_rules");
rule_record!(WordOrderRule, "word_order_rules.jsonl", "word_order_rules");
rule_record!(PostProcessingRule, "post_processing_rules.jsonl", "post_processing_rules");

impl RuleRecord {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("pattern", &self.pattern)?;
        require_language_pair(&self.language_pair)?;
        regex::Regex::new(&self.pattern)
            .map_err(|e| ValidationError::new("pattern", format!("invalid regex: {e}")))?;
        Ok(())
    }

    fn normalize(&mut self, now_ms: i64) {
        self.pattern = self.pattern.trim().to_string();
        self.description = self
            .description
            .take()
            .map(|d| collapse_whitespace(&d))
            .filter(|d| !d.is_empty());
        stamp(&mut self.created_at, &mut self.updated_at, now_ms);
    }

    fn merge(&mut self, incoming: Self) {
        self.replacement = incoming.replacement;
        self.priority = incoming.priority;
        self.enabled = incoming.enabled;
        if incoming.description.is_some() {
            self.description = incoming.description;
        }
        self.updated_at = self.updated_at.max(incoming.updated_at);
    }
}

/// Access to the shared rule shape from any of the rule marker types.
pub trait AsRule {
    const RULE_KIND: RuleKind;
    fn rule(&self) -> &RuleRecord;
}

impl AsRule for GrammarRule {
    const RULE_KIND: RuleKind = RuleKind::Grammar;
    fn rule(&self) -> &RuleRecord {
        &self.0
    }
}

impl AsRule for WordOrderRule {
    const RULE_KIND: RuleKind = RuleKind::WordOrder;
    fn rule(&self) -> &RuleRecord {
        &self.0
    }
}

impl AsRule for PostProcessingRule {
    const RULE_KIND: RuleKind = RuleKind::PostProcessing;
    fn rule(&self) -> &RuleRecord {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_validation_names_field() {
        let err = DictionaryEntry::new(" ", "mir", "en-ru").validate().unwrap_err();
        assert_eq!(err.field, "source_word");
        let err = DictionaryEntry::new("peace", "mir", "english-ru").validate().unwrap_err();
        assert_eq!(err.field, "language_pair");
    }

    #[test]
    fn phrase_confidence_bounds() {
        let err = PhraseEntry::new("thank you", "spasibo", "en-ru", 120.0)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "confidence");
        PhraseEntry::new("thank you", "spasibo", "en-ru", 100.0)
            .validate()
            .unwrap();
    }

    #[test]
    fn normalize_canonicalises_source_and_stamps() {
        let mut entry = DictionaryEntry::new("  Big   Cat ", " bolshoy  kot ", "en-ru");
        entry.normalize(1_000);
        assert_eq!(entry.source_word, "big cat");
        assert_eq!(entry.target_word, "bolshoy kot");
        assert_eq!(entry.created_at, 1_000);
        assert_eq!(entry.updated_at, 1_000);
    }

    #[test]
    fn phrase_merge_sums_frequency_and_averages_confidence() {
        let mut existing = PhraseEntry::new("good night", "spokoynoy nochi", "en-ru", 90.0);
        existing.frequency = 3;
        let mut incoming = PhraseEntry::new("good night", "dobroy nochi", "en-ru", 70.0);
        incoming.frequency = 2;
        existing.merge(incoming);
        assert_eq!(existing.frequency, 5);
        assert_eq!(existing.confidence, 80.0);
        assert_eq!(existing.target_phrase, "dobroy nochi");
    }

    #[test]
    fn rule_rejects_bad_regex() {
        let rule = GrammarRule(RuleRecord::new("(unclosed", "x", "en-ru", 1));
        assert_eq!(rule.validate().unwrap_err().field, "pattern");
    }

    #[test]
    fn rule_key_keeps_pattern_case() {
        let rule = WordOrderRule(RuleRecord::new(r"\bThe (\w+)\b", "$1", "en-ru", 1));
        assert_eq!(rule.key(), r"\bThe (\w+)\b");
    }

    #[test]
    fn phrase_accepts_word_field_names() {
        let line = r#"{"source_word":"see you","target_word":"do vstrechi","language_pair":"en-ru","confidence":85}"#;
        let phrase: PhraseEntry = serde_json::from_str(line).unwrap();
        assert_eq!(phrase.source_phrase, "see you");
        assert_eq!(phrase.frequency, 1);
    }
}

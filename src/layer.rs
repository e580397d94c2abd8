//! Layer contract consumed by the pipeline.
//! A layer is one transformation stage; it inspects the current text and the
//! request context, and returns the rewritten text plus debug counters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LayerError;

/// Stage kind. The pipeline registry holds at most one layer per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayerType {
    PreProcessing,
    PhraseLookup,
    Dictionary,
    Grammar,
    WordOrder,
    PostProcessing,
}

impl LayerType {
    pub const ALL: [LayerType; 6] = [
        LayerType::PreProcessing,
        LayerType::PhraseLookup,
        LayerType::Dictionary,
        LayerType::Grammar,
        LayerType::WordOrder,
        LayerType::PostProcessing,
    ];

    /// Conventional priority for the stage; lower runs first.
    pub fn default_priority(self) -> i32 {
        match self {
            LayerType::PreProcessing => 100,
            LayerType::PhraseLookup => 200,
            LayerType::Dictionary => 300,
            LayerType::Grammar => 400,
            LayerType::WordOrder => 500,
            LayerType::PostProcessing => 600,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerType::PreProcessing => "preProcessing",
            LayerType::PhraseLookup => "phraseLookup",
            LayerType::Dictionary => "dictionary",
            LayerType::Grammar => "grammar",
            LayerType::WordOrder => "wordOrder",
            LayerType::PostProcessing => "postProcessing",
        }
    }
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request context handed to every layer.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    pub request_id: String,
    pub source_lang: String,
    pub target_lang: String,
    /// Degrade mode: when set, only these layer types may run.
    pub allowed_layers: Option<Vec<LayerType>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TranslationContext {
    pub fn new(source_lang: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            source_lang: source_lang.into().trim().to_lowercase(),
            target_lang: target_lang.into().trim().to_lowercase(),
            allowed_layers: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_allowed_layers(mut self, layers: Vec<LayerType>) -> Self {
        self.allowed_layers = Some(layers);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// "en-ru" style key used by every repository.
    pub fn language_pair(&self) -> String {
        format!("{}-{}", self.source_lang, self.target_lang)
    }
}

/// Counters a layer reports about one run. Feeds the confidence score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerDebugInfo {
    pub items_processed: usize,
    pub modifications: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub additional_info: HashMap<String, serde_json::Value>,
}

impl LayerDebugInfo {
    /// modifications / items_processed clamped to [0, 1], None if nothing was processed.
    pub fn modification_density(&self) -> Option<f64> {
        (self.items_processed > 0)
            .then(|| (self.modifications as f64 / self.items_processed as f64).clamp(0.0, 1.0))
    }
}

/// What `Layer::process` returns.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub processed_text: String,
    pub debug: LayerDebugInfo,
}

impl LayerOutput {
    pub fn new(processed_text: impl Into<String>, debug: LayerDebugInfo) -> Self {
        Self {
            processed_text: processed_text.into(),
            debug,
        }
    }

    /// Pass-through output with no modifications.
    pub fn unchanged(text: &str) -> Self {
        Self::new(text, LayerDebugInfo::default())
    }
}

/// A pluggable transformation stage.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable summary shown in execution reports.
    fn description(&self) -> &str {
        self.name()
    }

    fn layer_type(&self) -> LayerType;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        self.layer_type().default_priority()
    }

    fn can_handle(&self, text: &str, context: &TranslationContext) -> bool;

    fn process(&self, text: &str, context: &TranslationContext) -> Result<LayerOutput, LayerError>;
}

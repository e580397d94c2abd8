//! Pipeline orchestrator.
//! Layers run in ascending priority; each receives the previous layer's output.
//! A failing layer is recorded and reported to the health monitor, then skipped;
//! it never aborts the run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LayerError;
use crate::health::LayerHealthMonitor;
use crate::layer::{Layer, LayerDebugInfo, LayerType, TranslationContext};
use crate::metrics::{metric_names, MetricsRegistry};

/// Confidence reported when no layer ran.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

const W_SUCCESS: f64 = 0.4;
const W_MODIFIED: f64 = 0.4;
const W_DENSITY: f64 = 0.2;
const W_CACHE: f64 = 0.1;

/// One layer's part in a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct LayerExecution {
    pub layer_type: LayerType,
    pub name: String,
    pub description: String,
    pub success: bool,
    /// Skipped because its circuit was open; the layer was not invoked.
    pub circuit_open: bool,
    pub modified: bool,
    pub processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub debug: LayerDebugInfo,
}

impl LayerExecution {
    fn skipped_open(layer: &dyn Layer) -> Self {
        Self {
            layer_type: layer.layer_type(),
            name: layer.name().to_string(),
            description: layer.description().to_string(),
            success: false,
            circuit_open: true,
            modified: false,
            processing_time_ms: 0.0,
            error: Some("circuit open".to_string()),
            debug: LayerDebugInfo::default(),
        }
    }

    fn invoked(&self) -> bool {
        !self.circuit_open
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub original_text: String,
    pub translated_text: String,
    pub confidence: f64,
    pub layers: Vec<LayerExecution>,
    pub processing_time_ms: f64,
}

impl PipelineResult {
    /// Layers actually invoked (successfully or not).
    pub fn layers_executed(&self) -> usize {
        self.layers.iter().filter(|l| l.invoked()).count()
    }

    pub fn failed_layers(&self) -> impl Iterator<Item = &LayerExecution> {
        self.layers.iter().filter(|l| l.invoked() && !l.success)
    }
}

/// Registry of layers keyed by `LayerType`, sorted by priority.
pub struct Pipeline {
    layers: RwLock<Vec<Arc<dyn Layer>>>,
    health: Arc<LayerHealthMonitor>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Pipeline {
    pub fn new(health: Arc<LayerHealthMonitor>) -> Self {
        Self {
            layers: RwLock::new(Vec::new()),
            health,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(&self) -> &Arc<LayerHealthMonitor> {
        &self.health
    }

    /// Register `layer`, replacing any layer of the same type. Returns the replaced layer.
    pub fn register_layer(&self, layer: Arc<dyn Layer>) -> Option<Arc<dyn Layer>> {
        let layer_type = layer.layer_type();
        let mut layers = self.layers.write();
        let replaced = layers
            .iter()
            .position(|l| l.layer_type() == layer_type)
            .map(|idx| layers.remove(idx));
        debug!(
            layer = %layer_type,
            name = layer.name(),
            priority = layer.priority(),
            replaced = replaced.is_some(),
            "layer_registered"
        );
        layers.push(layer);
        // stable: equal priorities keep registration order
        layers.sort_by_key(|l| l.priority());
        replaced
    }

    pub fn unregister_layer(&self, layer_type: LayerType) -> Option<Arc<dyn Layer>> {
        let mut layers = self.layers.write();
        let idx = layers.iter().position(|l| l.layer_type() == layer_type)?;
        Some(layers.remove(idx))
    }

    /// Registered layer types in execution order.
    pub fn layer_types(&self) -> Vec<LayerType> {
        self.layers.read().iter().map(|l| l.layer_type()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }

    /// Run applicable, healthy layers over `text`.
    pub fn process(&self, text: &str, context: &TranslationContext) -> PipelineResult {
        let started = std::time::Instant::now();
        // snapshot so registration never waits on a running request
        let candidates: Vec<Arc<dyn Layer>> = {
            let layers = self.layers.read();
            match &context.allowed_layers {
                Some(allowed) => layers
                    .iter()
                    .filter(|l| allowed.contains(&l.layer_type()))
                    .cloned()
                    .collect(),
                None => layers.clone(),
            }
        };

        let mut current = text.to_string();
        let mut executions = Vec::with_capacity(candidates.len());

        for layer in &candidates {
            let layer_type = layer.layer_type();
            if self.health.is_open(layer_type) {
                debug!(layer = %layer_type, request_id = %context.request_id, "layer_skipped_circuit_open");
                executions.push(LayerExecution::skipped_open(layer.as_ref()));
                continue;
            }
            if !layer.can_handle(&current, context) {
                continue;
            }

            let layer_started = std::time::Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| layer.process(&current, context)))
                .unwrap_or_else(|panic| Err(LayerError::Panicked(panic_message(panic.as_ref()))));
            let elapsed = layer_started.elapsed();
            if let Some(metrics) = &self.metrics {
                metrics.record(metric_names::LAYER_DONE, elapsed.as_secs_f64() * 1e6);
            }
            let processing_time_ms = elapsed.as_secs_f64() * 1000.0;

            match outcome {
                Ok(output) => {
                    let modified = output.processed_text != current;
                    self.health.record_success(layer_type);
                    debug!(
                        layer = %layer_type,
                        request_id = %context.request_id,
                        modified,
                        modifications = output.debug.modifications,
                        ms = processing_time_ms,
                        "layer_done"
                    );
                    executions.push(LayerExecution {
                        layer_type,
                        name: layer.name().to_string(),
                        description: layer.description().to_string(),
                        success: true,
                        circuit_open: false,
                        modified,
                        processing_time_ms,
                        error: None,
                        debug: output.debug,
                    });
                    current = output.processed_text;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.health.record_error(layer_type, &message);
                    warn!(layer = %layer_type, request_id = %context.request_id, error = %message, "layer_failed");
                    executions.push(LayerExecution {
                        layer_type,
                        name: layer.name().to_string(),
                        description: layer.description().to_string(),
                        success: false,
                        circuit_open: false,
                        modified: false,
                        processing_time_ms,
                        error: Some(message),
                        debug: LayerDebugInfo::default(),
                    });
                }
            }
        }

        let confidence = confidence(&executions);
        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(metrics) = &self.metrics {
            metrics.record(metric_names::PIPELINE_DONE, processing_time_ms * 1000.0);
        }

        PipelineResult {
            original_text: text.to_string(),
            translated_text: current,
            confidence,
            layers: executions,
            processing_time_ms,
        }
    }
}

/// `0.4·success + 0.4·modified + 0.2·density + 0.1·cacheHit`, each term and the
/// sum clamped to [0, 1]. Ratios are over invoked layers; 0.5 if none ran.
pub fn confidence(executions: &[LayerExecution]) -> f64 {
    let invoked: Vec<&LayerExecution> = executions.iter().filter(|e| e.invoked()).collect();
    if invoked.is_empty() {
        return NEUTRAL_CONFIDENCE;
    }
    let n = invoked.len() as f64;
    let success_ratio = invoked.iter().filter(|e| e.success).count() as f64 / n;
    let modified_ratio = invoked.iter().filter(|e| e.modified).count() as f64 / n;

    let densities: Vec<f64> = invoked
        .iter()
        .filter_map(|e| e.debug.modification_density())
        .collect();
    let avg_density = if densities.is_empty() {
        0.0
    } else {
        densities.iter().sum::<f64>() / densities.len() as f64
    };

    let (hits, misses) = invoked.iter().fold((0u64, 0u64), |(h, m), e| {
        (h + e.debug.cache_hits, m + e.debug.cache_misses)
    });
    let cache_hit_ratio = if hits + misses == 0 {
        0.0
    } else {
        hits as f64 / (hits + misses) as f64
    };

    let sum = W_SUCCESS * success_ratio.clamp(0.0, 1.0)
        + W_MODIFIED * modified_ratio.clamp(0.0, 1.0)
        + W_DENSITY * avg_density.clamp(0.0, 1.0)
        + W_CACHE * cache_hit_ratio.clamp(0.0, 1.0);
    sum.clamp(0.0, 1.0)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthThresholds;
    use crate::layer::LayerOutput;

    struct Upper(LayerType, i32);

    impl Layer for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn layer_type(&self) -> LayerType {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        fn can_handle(&self, _: &str, _: &TranslationContext) -> bool {
            true
        }
        fn process(&self, text: &str, _: &TranslationContext) -> Result<LayerOutput, LayerError> {
            Ok(LayerOutput::new(format!("{text}|{}", self.0), LayerDebugInfo::default()))
        }
    }

    struct Panics;

    impl Layer for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        fn description(&self) -> &str {
            "grammar stage that always panics"
        }
        fn layer_type(&self) -> LayerType {
            LayerType::Grammar
        }
        fn can_handle(&self, _: &str, _: &TranslationContext) -> bool {
            true
        }
        fn process(&self, _: &str, _: &TranslationContext) -> Result<LayerOutput, LayerError> {
            panic!("grammar exploded")
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(LayerHealthMonitor::new(true, HealthThresholds::default()))
    }

    fn ctx() -> TranslationContext {
        TranslationContext::new("en", "ru")
    }

    #[test]
    fn runs_in_priority_order_and_replaces_same_type() {
        let p = pipeline();
        p.register_layer(Arc::new(Upper(LayerType::WordOrder, 5)));
        p.register_layer(Arc::new(Upper(LayerType::Dictionary, 1)));
        let replaced = p.register_layer(Arc::new(Upper(LayerType::WordOrder, 0)));
        assert!(replaced.is_some());
        assert_eq!(p.layer_types(), vec![LayerType::WordOrder, LayerType::Dictionary]);
        let result = p.process("x", &ctx());
        assert_eq!(result.translated_text, "x|wordOrder|dictionary");
    }

    #[test]
    fn panicking_layer_is_isolated() {
        let p = pipeline();
        p.register_layer(Arc::new(Upper(LayerType::Dictionary, 1)));
        p.register_layer(Arc::new(Panics));
        p.register_layer(Arc::new(Upper(LayerType::PostProcessing, 9)));
        let result = p.process("x", &ctx());
        assert_eq!(result.translated_text, "x|dictionary|postProcessing");
        let failed: Vec<_> = result.failed_layers().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("grammar exploded"));
        assert_eq!(result.layers_executed(), 3);
    }

    #[test]
    fn executions_carry_layer_descriptions() {
        let p = pipeline();
        p.register_layer(Arc::new(Upper(LayerType::Dictionary, 1)));
        p.register_layer(Arc::new(Panics));
        let result = p.process("x", &ctx());
        let described: Vec<(&str, &str)> = result
            .layers
            .iter()
            .map(|l| (l.name.as_str(), l.description.as_str()))
            .collect();
        assert_eq!(
            described,
            vec![("upper", "upper"), ("panics", "grammar stage that always panics")]
        );
    }

    #[test]
    fn nothing_ran_means_neutral_confidence() {
        let p = pipeline();
        let result = p.process("hello", &ctx());
        assert_eq!(result.translated_text, "hello");
        assert_eq!(result.confidence, NEUTRAL_CONFIDENCE);
        assert_eq!(result.layers_executed(), 0);
    }

    #[test]
    fn allow_list_restricts_layers() {
        let p = pipeline();
        p.register_layer(Arc::new(Upper(LayerType::Dictionary, 1)));
        p.register_layer(Arc::new(Upper(LayerType::Grammar, 2)));
        let result = p.process("x", &ctx().with_allowed_layers(vec![LayerType::Grammar]));
        assert_eq!(result.translated_text, "x|grammar");
    }

    fn execution(modified: bool, items: usize, mods: usize, hits: u64, misses: u64) -> LayerExecution {
        LayerExecution {
            layer_type: LayerType::Dictionary,
            name: "t".into(),
            description: String::new(),
            success: true,
            circuit_open: false,
            modified,
            processing_time_ms: 0.0,
            error: None,
            debug: LayerDebugInfo {
                items_processed: items,
                modifications: mods,
                cache_hits: hits,
                cache_misses: misses,
                ..Default::default()
            },
        }
    }

    #[test]
    fn confidence_formula_exact_value() {
        // success 1, modified 0.5, density d = 0.25, cache hit 1
        let runs = vec![execution(true, 4, 1, 3, 0), execution(false, 0, 0, 0, 0)];
        let expected = 0.4 + 0.2 + 0.2 * 0.25 + 0.1;
        assert!((confidence(&runs) - expected).abs() < 1e-12);
        assert!((confidence(&runs) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn confidence_sum_is_clamped() {
        let runs = vec![execution(true, 2, 2, 1, 0)];
        assert_eq!(confidence(&runs), 1.0);
    }

    #[test]
    fn circuit_open_entries_are_not_invoked() {
        let mut open = execution(false, 0, 0, 0, 0);
        open.success = false;
        open.circuit_open = true;
        let runs = vec![execution(true, 1, 1, 0, 0), open];
        // 0.4 + 0.4 + 0.2, cache ratio 0 without lookups
        assert!((confidence(&runs) - 1.0).abs() < 1e-12);
    }
}

//! End-to-end tests for the engine facade: admission, serialization,
//! timeouts, history, degrade mode, and lifecycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lexiflow::error::LayerError;
use lexiflow::health::CircuitState;
use lexiflow::{
    DictionaryEntry, Engine, EngineBuilder, EngineConfig, EngineError, EngineState, Layer,
    LayerDebugInfo, LayerOutput, LayerType, OutcomeStatus, TranslationContext,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Upper-cases its input after sleeping, and records what it saw.
struct RecordingLayer {
    delay: Duration,
    seen: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
}

impl RecordingLayer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            seen: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            overlapped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Layer for RecordingLayer {
    fn name(&self) -> &str {
        "recording"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::PreProcessing
    }

    fn can_handle(&self, _text: &str, _context: &TranslationContext) -> bool {
        true
    }

    fn process(&self, text: &str, _context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(self.delay);
        self.seen.lock().push(text.to_string());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(LayerOutput::new(
            text.to_uppercase(),
            LayerDebugInfo {
                items_processed: 1,
                modifications: 1,
                ..Default::default()
            },
        ))
    }
}

struct FailingGrammar;

impl Layer for FailingGrammar {
    fn name(&self) -> &str {
        "failing_grammar"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::Grammar
    }

    fn can_handle(&self, _text: &str, _context: &TranslationContext) -> bool {
        true
    }

    fn process(&self, _text: &str, _context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        Err(LayerError::Processing("grammar tables unavailable".into()))
    }
}

/// Panics while the pipeline is choosing layers.
struct BrokenGate;

impl Layer for BrokenGate {
    fn name(&self) -> &str {
        "broken_gate"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::WordOrder
    }

    fn can_handle(&self, _text: &str, _context: &TranslationContext) -> bool {
        panic!("gate table missing")
    }

    fn process(&self, text: &str, _context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        Ok(LayerOutput::unchanged(text))
    }
}

async fn engine_with(dir: &TempDir, config: EngineConfig, layer: RecordingLayer) -> Engine {
    EngineBuilder::new(dir.path())
        .with_config(config)
        .without_default_layers()
        .with_layer(Arc::new(layer))
        .build()
        .await
        .unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn empty_input_is_an_outcome_not_an_error() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(dir.path()).build().await.unwrap();

    let outcome = engine.translate("", "en", "ru").await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::EmptyInput);
    assert_eq!(outcome.code(), "empty_input");
    assert_eq!(outcome.processing_time_ms, 0.0);
    assert_eq!(outcome.layers_executed(), 0);

    let blank = engine.translate("   \n", "en", "ru").await.unwrap();
    assert_eq!(blank.status, OutcomeStatus::EmptyInput);

    let counters = engine.get_metrics().counters;
    assert_eq!(counters.empty_inputs, 2);
    assert_eq!(counters.total_translations, 0);
}

#[tokio::test]
async fn dictionary_entries_flow_through_default_layers() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(dir.path()).build().await.unwrap();
    let added = engine
        .add_dictionary_entries(vec![
            DictionaryEntry::new("hello", "privet", "en-ru"),
            DictionaryEntry::new("world", "mir", "en-ru"),
        ])
        .await
        .unwrap();
    assert_eq!(added, 2);

    let outcome = engine.translate("Hello world!", "en", "ru").await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.code(), "ok");
    assert_eq!(outcome.translated_text, "Privet mir!");
    assert!(outcome.confidence > 0.0 && outcome.confidence <= 1.0);
    let dictionary = outcome
        .layers
        .iter()
        .find(|l| l.layer_type == LayerType::Dictionary)
        .unwrap();
    assert!(dictionary.success && dictionary.modified);

    let history = engine.recent_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].translated_text, "Privet mir!");
    assert_eq!(history[0].request_id, outcome.request_id);

    let metrics = engine.get_metrics();
    assert_eq!(metrics.counters.successful_translations, 1);
    assert_eq!(metrics.state, EngineState::Ready);
    assert!(metrics
        .timings
        .contains_key(lexiflow::metrics::metric_names::PIPELINE_DONE));
}

#[tokio::test]
async fn queue_full_rejects_without_running_the_pipeline() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.queue.max_pending = 1;
    let layer = RecordingLayer::new(Duration::from_millis(300));
    let seen = layer.seen.clone();
    let engine = engine_with(&dir, config, layer).await;

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.translate("one", "en", "ru").await }
    });
    wait_until(|| engine.get_metrics().pending_requests == 1).await;

    let rejected = engine.translate("two", "en", "ru").await.unwrap();
    assert_eq!(rejected.status, OutcomeStatus::QueueFull);
    assert_eq!(rejected.code(), "queue_full");
    assert!(rejected.layers.is_empty());

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.translated_text, "ONE");
    assert_eq!(*seen.lock(), vec!["one".to_string()]);
    assert_eq!(engine.get_metrics().counters.queue_rejections, 1);
    assert_eq!(engine.get_metrics().pending_requests, 0);
}

#[tokio::test]
async fn concurrent_requests_run_one_at_a_time_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let layer = RecordingLayer::new(Duration::from_millis(20));
    let seen = layer.seen.clone();
    let overlapped = layer.overlapped.clone();
    let engine = engine_with(&dir, EngineConfig::default(), layer).await;

    let (a, b, c) = tokio::join!(
        engine.translate("a", "en", "ru"),
        engine.translate("b", "en", "ru"),
        engine.translate("c", "en", "ru"),
    );
    assert_eq!(a.unwrap().translated_text, "A");
    assert_eq!(b.unwrap().translated_text, "B");
    assert_eq!(c.unwrap().translated_text, "C");
    assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    assert!(!overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn timeout_returns_early_and_work_finishes_in_background() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.timeouts.translate_ms = 50;
    let layer = RecordingLayer::new(Duration::from_millis(300));
    let seen = layer.seen.clone();
    let engine = engine_with(&dir, config, layer).await;

    let outcome = engine.translate("slow", "en", "ru").await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Timeout);
    assert_eq!(outcome.code(), "timeout");
    assert!(seen.lock().is_empty());

    wait_until(|| engine.get_metrics().counters.successful_translations == 1).await;
    assert_eq!(*seen.lock(), vec!["slow".to_string()]);
    assert_eq!(engine.get_metrics().counters.timeouts, 1);
    // the background job holds its admission slot until it finishes
    wait_until(|| engine.get_metrics().pending_requests == 0).await;
}

#[tokio::test]
async fn rate_limiter_spaces_requests() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.security.rate_limiting = true;
    config.security.max_requests_per_minute = 600;
    let engine = engine_with(&dir, config, RecordingLayer::new(Duration::ZERO)).await;

    let started = Instant::now();
    for text in ["x", "y", "z"] {
        assert!(engine.translate(text, "en", "ru").await.unwrap().is_success());
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn degrade_mode_restricts_layers() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.degrade.enabled = true;
    config.degrade.allowed_layers = vec![LayerType::PreProcessing, LayerType::Dictionary];
    let engine = EngineBuilder::new(dir.path())
        .with_config(config)
        .build()
        .await
        .unwrap();

    let outcome = engine.translate("some text here", "en", "ru").await.unwrap();
    assert!(outcome.is_success());
    assert!(outcome
        .layers
        .iter()
        .all(|l| matches!(l.layer_type, LayerType::PreProcessing | LayerType::Dictionary)));

    // an explicit allow-list from the caller wins
    let context = TranslationContext::new("en", "ru").with_allowed_layers(vec![LayerType::Grammar]);
    let outcome = engine
        .translate_with_context("some text here", context)
        .await
        .unwrap();
    assert!(outcome.layers.iter().all(|l| l.layer_type == LayerType::Grammar));
}

#[tokio::test]
async fn failing_layer_trips_its_circuit_and_can_be_restored() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.health_monitoring.min_requests = 3;
    config.health_monitoring.error_threshold = 0.5;
    let engine = EngineBuilder::new(dir.path())
        .with_config(config)
        .with_layer(Arc::new(FailingGrammar))
        .build()
        .await
        .unwrap();
    engine
        .add_dictionary_entries(vec![DictionaryEntry::new("cat", "koshka", "en-ru")])
        .await
        .unwrap();

    for _ in 0..3 {
        let outcome = engine.translate("cat", "en", "ru").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.translated_text, "koshka");
    }
    let grammar = engine
        .get_layer_health()
        .into_iter()
        .find(|h| h.layer_type == LayerType::Grammar)
        .unwrap();
    assert_eq!(grammar.state, CircuitState::Open);

    let outcome = engine.translate("cat", "en", "ru").await.unwrap();
    let entry = outcome
        .layers
        .iter()
        .find(|l| l.layer_type == LayerType::Grammar)
        .unwrap();
    assert!(entry.circuit_open);
    assert_eq!(outcome.translated_text, "koshka");

    engine.force_restore_layer(LayerType::Grammar).unwrap();
    let grammar = engine
        .get_layer_health()
        .into_iter()
        .find(|h| h.layer_type == LayerType::Grammar)
        .unwrap();
    assert_eq!(grammar.state, CircuitState::Closed);
}

#[tokio::test]
async fn reset_keeps_data_and_dispose_is_final() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(dir.path()).build().await.unwrap();
    engine
        .add_dictionary_entries(vec![DictionaryEntry::new("dog", "sobaka", "en-ru")])
        .await
        .unwrap();

    engine.reset().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
    let outcome = engine.translate("dog", "en", "ru").await.unwrap();
    assert_eq!(outcome.translated_text, "sobaka");

    engine.dispose().await.unwrap();
    assert_eq!(engine.state(), EngineState::Disposed);
    assert!(matches!(
        engine.translate("dog", "en", "ru").await,
        Err(EngineError::Disposed)
    ));
    assert!(matches!(
        engine
            .add_dictionary_entries(vec![DictionaryEntry::new("a", "b", "en-ru")])
            .await,
        Err(EngineError::Disposed)
    ));
    assert!(matches!(engine.reset(), Err(EngineError::Disposed)));
    // reads still work after dispose
    assert_eq!(engine.get_metrics().state, EngineState::Disposed);
    assert_eq!(engine.memory_usage().loaded_pairs, 0);

    // data survived on disk for the next engine
    let reopened = EngineBuilder::new(dir.path()).build().await.unwrap();
    let outcome = reopened.translate("dog", "en", "ru").await.unwrap();
    assert_eq!(outcome.translated_text, "sobaka");
}

#[tokio::test]
async fn dispose_finishes_the_running_request_and_fails_queued_ones() {
    let dir = TempDir::new().unwrap();
    let layer = RecordingLayer::new(Duration::from_millis(200));
    let seen = layer.seen.clone();
    let active = layer.active.clone();
    let engine = engine_with(&dir, EngineConfig::default(), layer).await;

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.translate("one", "en", "ru").await }
    });
    wait_until(|| active.load(Ordering::SeqCst) == 1).await;
    let second = tokio::spawn({
        let engine = engine.clone();
        async move { engine.translate("two", "en", "ru").await }
    });
    wait_until(|| engine.get_metrics().pending_requests == 2).await;

    engine.dispose().await.unwrap();
    assert_eq!(engine.state(), EngineState::Disposed);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.translated_text, "ONE");
    assert!(matches!(second.await.unwrap(), Err(EngineError::Disposed)));
    assert_eq!(*seen.lock(), vec!["one".to_string()]);
    assert_eq!(engine.memory_usage().loaded_pairs, 0);
}

#[tokio::test]
async fn crashed_pipeline_fails_the_request_and_leaves_the_engine_ready() {
    let dir = TempDir::new().unwrap();
    let engine = EngineBuilder::new(dir.path())
        .without_default_layers()
        .with_layer(Arc::new(BrokenGate))
        .build()
        .await
        .unwrap();

    let outcome = engine.translate("anything", "en", "ru").await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.translated_text, "anything");
    assert!(outcome.message.as_deref().unwrap_or("").contains("pipeline task failed"));
    assert_eq!(engine.state(), EngineState::Ready);

    let metrics = engine.get_metrics();
    assert_eq!(metrics.counters.failed_translations, 1);
    assert!(metrics.last_error.is_some());
    // still accepting work
    let again = engine.translate("again", "en", "ru").await.unwrap();
    assert_eq!(again.status, OutcomeStatus::Failed);
    assert_eq!(engine.state(), EngineState::Ready);
}

#[tokio::test]
async fn config_file_is_loaded_by_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lexiflow.toml");
    std::fs::write(
        &path,
        "[queue]\nmax_pending = 7\n\n[timeouts]\ntranslate_ms = 1500\n",
    )
    .unwrap();
    let engine = EngineBuilder::new(dir.path().join("data"))
        .with_config_file(&path)
        .unwrap()
        .build()
        .await
        .unwrap();
    assert_eq!(engine.config().queue.max_pending, 7);
    assert_eq!(engine.config().timeouts.translate_ms, 1500);
    assert!(engine.data_dir().is_dir());
}

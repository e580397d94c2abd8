//! Public facade.
//! `EngineBuilder` validates the data directory, wires cache, memory manager,
//! repositories, health monitor and pipeline, and returns an `Engine` handle.
//!
//! Request path (`translate`):
//! 1. admission: over `queue.max_pending` → queue-full outcome, nothing queued
//! 2. rate limit wait (if enabled)
//! 3. state check: typed error unless Ready/Processing
//! 4. empty input → empty-input outcome, zero processing time
//! 5. serialized slot: one pipeline run at a time, FIFO
//! 6. timeout races the slot from the caller's side only; the job still completes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheInfo, CacheManager};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::health::{LayerHealthMonitor, LayerHealthSnapshot};
use crate::layer::{Layer, LayerType, TranslationContext};
use crate::layers::default_layers;
use crate::memory::{MemoryManager, MemoryUsage};
use crate::metrics::{
    metric_names, CounterSnapshot, EngineCounters, MetricSummary, MetricsRegistry, RequestId,
};
use crate::pipeline::{LayerExecution, Pipeline, PipelineResult};
use crate::repository::record::{now_millis, DictionaryEntry, PhraseEntry};
use crate::repository::user::{HistoryRecord, HistoryWriter};
use crate::repository::{Repositories, RepositoryStatus};
use crate::scheduler::{AdmissionControl, RateLimiter, SerialExecutor};
use crate::state_machine::{EngineState, StateMachine};
use crate::storage::Storage;

/// Classification of a `translate` call. Only `Success` carries a pipeline result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    EmptyInput,
    QueueFull,
    Timeout,
    Failed,
}

impl OutcomeStatus {
    /// Stable code for callers and logs.
    pub fn code(self) -> &'static str {
        match self {
            OutcomeStatus::Success => "ok",
            OutcomeStatus::EmptyInput => "empty_input",
            OutcomeStatus::QueueFull => "queue_full",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Failed => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslationOutcome {
    pub request_id: String,
    pub status: OutcomeStatus,
    pub original_text: String,
    pub translated_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub confidence: f64,
    pub processing_time_ms: f64,
    pub layers: Vec<LayerExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TranslationOutcome {
    fn degraded(
        request_id: &RequestId,
        status: OutcomeStatus,
        text: &str,
        context: &TranslationContext,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            original_text: text.to_string(),
            translated_text: text.to_string(),
            source_lang: context.source_lang.clone(),
            target_lang: context.target_lang.clone(),
            confidence: 0.0,
            processing_time_ms: 0.0,
            layers: Vec::new(),
            message: Some(message.into()),
        }
    }

    fn success(request_id: &RequestId, context: &TranslationContext, result: PipelineResult, elapsed_ms: f64) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: OutcomeStatus::Success,
            original_text: result.original_text,
            translated_text: result.translated_text,
            source_lang: context.source_lang.clone(),
            target_lang: context.target_lang.clone(),
            confidence: result.confidence,
            processing_time_ms: elapsed_ms,
            layers: result.layers,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn code(&self) -> &'static str {
        self.status.code()
    }

    /// Layers actually invoked for this request.
    pub fn layers_executed(&self) -> usize {
        self.layers.iter().filter(|l| !l.circuit_open).count()
    }
}

/// Snapshot returned by `Engine::get_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub state: EngineState,
    pub counters: CounterSnapshot,
    pub pending_requests: usize,
    pub queued_jobs: usize,
    pub layers: Vec<LayerType>,
    pub cache: CacheInfo,
    pub memory: MemoryUsage,
    pub timings: std::collections::HashMap<String, MetricSummary>,
    pub last_error: Option<String>,
}

/// Builder for `Engine`.
///
/// ```rust,ignore
/// let engine = EngineBuilder::new("./data")
///     .with_config(EngineConfig::load(Path::new("lexiflow.toml"))?)
///     .build()
///     .await?;
/// let outcome = engine.translate("Hello world", "en", "ru").await?;
/// ```
pub struct EngineBuilder {
    data_dir: PathBuf,
    config: EngineConfig,
    layers: Vec<Arc<dyn Layer>>,
    default_layers: bool,
}

impl EngineBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config: EngineConfig::default(),
            layers: Vec::new(),
            default_layers: true,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> EngineResult<Self> {
        self.config = EngineConfig::load(path.as_ref())?;
        Ok(self)
    }

    /// Add a layer; replaces the built-in layer of the same type.
    pub fn with_layer(mut self, layer: Arc<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Register only the layers passed to `with_layer`.
    pub fn without_default_layers(mut self) -> Self {
        self.default_layers = false;
        self
    }

    /// Must be awaited inside a tokio runtime: the serialized worker, history
    /// writer and circuit reset timers are spawned on it.
    pub async fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        config.validate()?;

        let state = StateMachine::new();
        state.transition(EngineState::Initializing)?;

        let storage = Storage::new(&self.data_dir, &config.storage);
        if let Err(e) = storage.ensure_writable() {
            error!(path = %self.data_dir.display(), error = %e, "data directory not writable");
            return Err(EngineError::Initialization(format!(
                "data directory {} is not writable: {e}",
                self.data_dir.display()
            )));
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let cache = Arc::new(CacheManager::from_config(&config.cache));
        let memory = Arc::new(MemoryManager::from_config(&config.memory));
        let repositories = Arc::new(Repositories::open(
            &storage,
            Some(memory.clone()),
            Some(cache.clone()),
            &config.history,
        ));
        let health = LayerHealthMonitor::from_config(&config.health_monitoring);
        let pipeline =
            Arc::new(Pipeline::new(health.clone()).with_metrics(metrics.clone()));

        if self.default_layers {
            for layer in default_layers(&repositories) {
                pipeline.register_layer(layer);
            }
        }
        for layer in self.layers {
            pipeline.register_layer(layer);
        }
        if pipeline.is_empty() {
            error!("no translation layers registered");
            return Err(EngineError::NoLayers);
        }

        let rate_limiter = config
            .security
            .rate_limiting
            .then(|| RateLimiter::per_minute(config.security.max_requests_per_minute));
        let history = config
            .history
            .enabled
            .then(|| HistoryWriter::spawn(repositories.user.clone()));

        let inner = EngineInner {
            data_dir: self.data_dir,
            state,
            admission: AdmissionControl::new(config.queue.max_pending),
            rate_limiter,
            executor: SerialExecutor::start(metrics.clone()),
            timeout: config.timeouts.translate_timeout(),
            degrade: config.degrade.allow_list().map(<[LayerType]>::to_vec),
            pipeline,
            health,
            cache,
            memory,
            repositories,
            history: Mutex::new(history),
            metrics,
            counters: Arc::new(EngineCounters::default()),
            last_error: Mutex::new(None),
            config,
        };
        inner.state.transition(EngineState::Ready)?;
        info!(
            data_dir = %inner.data_dir.display(),
            layers = ?inner.pipeline.layer_types(),
            max_pending = inner.config.queue.max_pending,
            timeout_ms = inner.config.timeouts.translate_ms,
            rate_limiting = inner.config.security.rate_limiting,
            "engine initialized"
        );
        Ok(Engine {
            inner: Arc::new(inner),
        })
    }
}

struct EngineInner {
    data_dir: PathBuf,
    config: EngineConfig,
    state: StateMachine,
    admission: Arc<AdmissionControl>,
    rate_limiter: Option<RateLimiter>,
    executor: SerialExecutor,
    timeout: Option<Duration>,
    degrade: Option<Vec<LayerType>>,
    pipeline: Arc<Pipeline>,
    health: Arc<LayerHealthMonitor>,
    cache: Arc<CacheManager>,
    memory: Arc<MemoryManager>,
    repositories: Arc<Repositories>,
    history: Mutex<Option<HistoryWriter>>,
    metrics: Arc<MetricsRegistry>,
    counters: Arc<EngineCounters>,
    last_error: Mutex<Option<String>>,
}

/// Cheaply clonable engine handle. Clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(data_dir: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(data_dir)
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.current()
    }

    /// Watch state changes. `None` once disposed.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<EngineState>> {
        self.inner.state.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    fn ensure_live(&self, operation: &'static str) -> EngineResult<()> {
        let state = self.state();
        if state.is_shutting_down() {
            return Err(EngineError::Disposed);
        }
        if !state.accepts_requests() {
            return Err(EngineError::InvalidState { state, operation });
        }
        Ok(())
    }

    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> EngineResult<TranslationOutcome> {
        self.translate_with_context(text, TranslationContext::new(source_lang, target_lang))
            .await
    }

    /// Translate with a caller-built context (allow-list, metadata).
    pub async fn translate_with_context(
        &self,
        text: &str,
        mut context: TranslationContext,
    ) -> EngineResult<TranslationOutcome> {
        let inner = &self.inner;
        let request_id = RequestId::new();
        context.request_id = request_id.to_string();
        if context.allowed_layers.is_none() {
            context.allowed_layers = inner.degrade.clone();
        }

        let Some(permit) = inner.admission.try_admit() else {
            inner.counters.record_queue_rejection();
            warn!(request_id = %request_id, max_pending = inner.admission.max_pending(), "queue full");
            return Ok(TranslationOutcome::degraded(
                &request_id,
                OutcomeStatus::QueueFull,
                text,
                &context,
                "too many pending requests",
            ));
        };

        if let Some(limiter) = &inner.rate_limiter {
            let waited = limiter.wait().await;
            inner
                .metrics
                .record(metric_names::RATE_LIMIT_WAIT, waited.as_micros() as f64);
        }

        self.ensure_live("translate")?;

        if text.trim().is_empty() {
            inner.counters.record_empty();
            debug!(request_id = %request_id, "empty input");
            return Ok(TranslationOutcome::degraded(
                &request_id,
                OutcomeStatus::EmptyInput,
                text,
                &context,
                "input text is empty",
            ));
        }

        let job = {
            let inner = Arc::clone(&self.inner);
            let text = text.to_string();
            let context = context.clone();
            async move {
                // held until the job finishes, even if the caller timed out
                let _permit = permit;
                inner.run_job(text, context).await
            }
        };
        let reply = inner.executor.submit(job)?;

        let span = inner.metrics.span(metric_names::TRANSLATE_DONE);
        let started = Instant::now();
        let result = match inner.timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(result) => result,
                Err(_) => {
                    inner.counters.record_timeout();
                    warn!(
                        request_id = %request_id,
                        timeout_ms = limit.as_millis() as u64,
                        "translate timed out; job continues in background"
                    );
                    let mut outcome = TranslationOutcome::degraded(
                        &request_id,
                        OutcomeStatus::Timeout,
                        text,
                        &context,
                        format!("timed out after {} ms", limit.as_millis()),
                    );
                    outcome.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return Ok(outcome);
                }
            },
            None => reply.await,
        };

        span.finish();
        Ok(match result {
            Ok(Ok((pipeline_result, elapsed_ms))) => {
                TranslationOutcome::success(&request_id, &context, pipeline_result, elapsed_ms)
            }
            Ok(Err(JobFailure::Disposed)) => {
                debug!(request_id = %request_id, "queued request dropped by dispose");
                return Err(EngineError::Disposed);
            }
            Ok(Err(JobFailure::Failed(message))) => TranslationOutcome::degraded(
                &request_id,
                OutcomeStatus::Failed,
                text,
                &context,
                message,
            ),
            Err(_) => TranslationOutcome::degraded(
                &request_id,
                OutcomeStatus::Failed,
                text,
                &context,
                "execution slot dropped the request",
            ),
        })
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        let inner = &self.inner;
        EngineMetrics {
            state: self.state(),
            counters: inner.counters.snapshot(),
            pending_requests: inner.admission.pending(),
            queued_jobs: inner.executor.queued(),
            layers: inner.pipeline.layer_types(),
            cache: inner.cache.info(),
            memory: inner.memory.usage(),
            timings: inner.metrics.summary(),
            last_error: inner.last_error.lock().clone(),
        }
    }

    pub fn get_cache_info(&self) -> CacheInfo {
        self.inner.cache.info()
    }

    pub fn get_layer_health(&self) -> Vec<LayerHealthSnapshot> {
        self.inner.health.all()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner.memory.usage()
    }

    pub fn repositories(&self) -> Arc<Repositories> {
        Arc::clone(&self.inner.repositories)
    }

    pub fn repository_status(&self) -> Vec<RepositoryStatus> {
        self.inner.repositories.status()
    }

    /// Register or replace (same `LayerType`) a layer at runtime.
    pub fn register_layer(&self, layer: Arc<dyn Layer>) -> EngineResult<()> {
        self.ensure_live("register_layer")?;
        self.inner.pipeline.register_layer(layer);
        Ok(())
    }

    /// Close a layer's circuit and reset its counters.
    pub fn force_restore_layer(&self, layer_type: LayerType) -> EngineResult<()> {
        self.ensure_live("force_restore_layer")?;
        self.inner.health.force_close_circuit(layer_type);
        Ok(())
    }

    pub fn clear_cache(&self) -> EngineResult<()> {
        self.ensure_live("clear_cache")?;
        self.inner.cache.clear();
        info!("cache cleared");
        Ok(())
    }

    pub async fn add_dictionary_entries(&self, entries: Vec<DictionaryEntry>) -> EngineResult<usize> {
        self.ensure_live("add_dictionary_entries")?;
        let repo = self.inner.repositories.dictionary.clone();
        let count = tokio::task::spawn_blocking(move || repo.bulk_upsert(entries))
            .await
            .map_err(|e| EngineError::Internal(format!("dictionary write task failed: {e}")))??;
        info!(count, "dictionary entries added");
        Ok(count)
    }

    pub async fn add_phrases(&self, phrases: Vec<PhraseEntry>) -> EngineResult<usize> {
        self.ensure_live("add_phrases")?;
        let repo = self.inner.repositories.phrases.clone();
        let count = tokio::task::spawn_blocking(move || repo.bulk_upsert(phrases))
            .await
            .map_err(|e| EngineError::Internal(format!("phrase write task failed: {e}")))??;
        info!(count, "phrases added");
        Ok(count)
    }

    /// Newest first.
    pub async fn recent_history(&self, limit: usize) -> EngineResult<Vec<HistoryRecord>> {
        self.flush_history().await;
        let user = self.inner.repositories.user.clone();
        let records = tokio::task::spawn_blocking(move || user.recent_history(limit))
            .await
            .map_err(|e| EngineError::Internal(format!("history read task failed: {e}")))??;
        Ok(records)
    }

    /// Wait until queued history records are on disk.
    pub async fn flush_history(&self) {
        let writer = self.inner.history.lock().clone();
        if let Some(writer) = writer {
            writer.flush().await;
        }
    }

    /// Clear the last error and force Ready. Data stays loaded.
    pub fn reset(&self) -> EngineResult<()> {
        self.inner.state.force_ready()?;
        self.inner.last_error.lock().take();
        info!("engine reset");
        Ok(())
    }

    /// Irreversible. Waits for the job in flight, fails every queued request
    /// with `Disposed`, cancels circuit timers, flushes history, drops loaded
    /// indexes, and closes state notifications.
    pub async fn dispose(&self) -> EngineResult<()> {
        let inner = &self.inner;
        match inner.state.current() {
            EngineState::Disposed | EngineState::Disposing => return Ok(()),
            _ => {}
        }
        inner.state.transition(EngineState::Disposing)?;

        // queued jobs see Disposing and bail out without touching the pipeline
        inner.executor.drain().await;
        inner.health.dispose();
        let writer = inner.history.lock().take();
        if let Some(writer) = writer {
            writer.flush().await;
        }
        inner.repositories.unload_all();
        inner.memory.dispose();
        inner.cache.clear();

        inner.state.transition(EngineState::Disposed)?;
        inner.state.close();
        info!("engine disposed");
        Ok(())
    }
}

/// Why a serialized job produced no pipeline result.
enum JobFailure {
    /// The engine began disposing before the job reached the slot.
    Disposed,
    Failed(String),
}

impl EngineInner {
    /// Body of one serialized job. Runs the pipeline on the blocking pool.
    async fn run_job(
        self: Arc<Self>,
        text: String,
        context: TranslationContext,
    ) -> Result<(PipelineResult, f64), JobFailure> {
        if self.state.current().is_shutting_down() {
            return Err(JobFailure::Disposed);
        }
        self.state.settle(EngineState::Processing);
        let started = Instant::now();
        let pipeline = Arc::clone(&self.pipeline);
        let request_context = context.clone();
        let joined =
            tokio::task::spawn_blocking(move || pipeline.process(&text, &request_context)).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        match joined {
            Ok(result) => {
                self.counters.record_success(elapsed.as_micros() as u64);
                for failed in result.failed_layers() {
                    debug!(request_id = %context.request_id, layer = %failed.layer_type, "layer failure recorded");
                }
                self.record_history(&context, &result, elapsed_ms);
                info!(
                    request_id = %context.request_id,
                    layers = result.layers_executed(),
                    confidence = result.confidence,
                    ms = elapsed_ms,
                    "translate_done"
                );
                self.state.settle(EngineState::Ready);
                Ok((result, elapsed_ms))
            }
            Err(e) => {
                let message = format!("pipeline task failed: {e}");
                self.counters.record_failure();
                error!(request_id = %context.request_id, error = %message, "translate_failed");
                *self.last_error.lock() = Some(message.clone());
                // the request fails, the engine stays usable
                self.state.settle(EngineState::Ready);
                Err(JobFailure::Failed(message))
            }
        }
    }

    fn record_history(&self, context: &TranslationContext, result: &PipelineResult, elapsed_ms: f64) {
        let writer = self.history.lock().clone();
        let Some(writer) = writer else {
            return;
        };
        writer.record(HistoryRecord {
            request_id: context.request_id.clone(),
            source_text: result.original_text.clone(),
            translated_text: result.translated_text.clone(),
            source_lang: context.source_lang.clone(),
            target_lang: context.target_lang.clone(),
            confidence: result.confidence,
            processing_time_ms: elapsed_ms.round() as u64,
            created_at: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes_are_stable() {
        assert_eq!(OutcomeStatus::Success.code(), "ok");
        assert_eq!(OutcomeStatus::EmptyInput.code(), "empty_input");
        assert_eq!(OutcomeStatus::QueueFull.code(), "queue_full");
        assert_eq!(OutcomeStatus::Timeout.code(), "timeout");
        assert_eq!(OutcomeStatus::Failed.code(), "internal_error");
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::QueueFull).unwrap(),
            "\"queue_full\""
        );
    }

    #[tokio::test]
    async fn build_fails_without_layers() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = EngineBuilder::new(dir.path())
            .without_default_layers()
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::NoLayers));
    }

    #[tokio::test]
    async fn build_fails_on_unwritable_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let err = EngineBuilder::new(&file).build().await.err().unwrap();
        assert!(matches!(err, EngineError::Initialization(_)));
    }

    #[tokio::test]
    async fn reset_and_dispose_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = EngineBuilder::new(dir.path()).build().await.unwrap();
        let mut states = engine.subscribe_state().unwrap();
        assert_eq!(*states.borrow(), EngineState::Ready);

        engine.reset().unwrap();
        engine.dispose().await.unwrap();
        assert_eq!(engine.state(), EngineState::Disposed);
        // subscribers see the final state, then a closed channel
        assert_eq!(*states.borrow_and_update(), EngineState::Disposed);
        assert!(states.changed().await.is_err());
        assert!(engine.subscribe_state().is_none());

        assert!(matches!(engine.reset(), Err(EngineError::Disposed)));
        assert!(matches!(
            engine.translate("hi", "en", "ru").await,
            Err(EngineError::Disposed)
        ));
        assert!(matches!(engine.clear_cache(), Err(EngineError::Disposed)));
        engine.dispose().await.unwrap();
    }
}

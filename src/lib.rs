//! Lexiflow: offline rule-based translation engine.
//! Layered pipeline with per-layer circuit breaking, LRU+TTL caching, a
//! memory budget over lazily loaded language pairs, and atomic file-backed
//! dictionaries.

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod layer;
pub mod layers;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod storage;

pub use cache::{CacheInfo, CacheManager, TtlLruCache};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineMetrics, OutcomeStatus, TranslationOutcome};
pub use error::{ConfigError, EngineError, EngineResult, LayerError, RepositoryError};
pub use health::{CircuitState, LayerHealthMonitor};
pub use layer::{Layer, LayerDebugInfo, LayerOutput, LayerType, TranslationContext};
pub use memory::{MemoryManaged, MemoryManager, MemoryUsage};
pub use pipeline::{LayerExecution, Pipeline, PipelineResult};
pub use repository::record::{DictionaryEntry, PhraseEntry, RuleRecord};
pub use repository::{Repositories, Repository};
pub use state_machine::EngineState;

/// Install a global tracing subscriber. Filter comes from `RUST_LOG`
/// (default `lexiflow=info`); `LEXIFLOW_LOG_FORMAT=json` switches to JSON lines.
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lexiflow=info"));
    let json = std::env::var("LEXIFLOW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_ok() {
        tracing::info!("lexiflow tracing initialized");
    }
}

//! Engine configuration tree.
//! Every section has defaults, so a config file only needs the keys it changes.
//! Files ending in `.toml` are parsed as TOML, anything else as JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layer::LayerType;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub degrade: DegradeSection,
    #[serde(default)]
    pub health_monitoring: HealthSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub history: HistorySection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub word_cache_size: usize,
    pub phrase_cache_size: usize,
    pub generic_cache_size: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            word_cache_size: 5000,
            phrase_cache_size: 2000,
            generic_cache_size: 1000,
            ttl_seconds: 3600,
        }
    }
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub rate_limiting: bool,
    pub max_requests_per_minute: u32,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            rate_limiting: false,
            max_requests_per_minute: 60,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 0 = unlimited.
    pub max_pending: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// 0 = no timeout.
    pub translate_ms: u64,
}

impl TimeoutsSection {
    pub fn translate_timeout(&self) -> Option<Duration> {
        (self.translate_ms > 0).then(|| Duration::from_millis(self.translate_ms))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradeSection {
    pub enabled: bool,
    pub allowed_layers: Vec<LayerType>,
}

impl DegradeSection {
    /// The allow-list to hand the pipeline, if degrade mode is on.
    pub fn allow_list(&self) -> Option<&[LayerType]> {
        self.enabled.then_some(self.allowed_layers.as_slice())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub enabled: bool,
    pub error_threshold: f64,
    pub min_requests: u64,
    pub reset_timeout_seconds: u64,
    pub success_threshold: u32,
    pub window_seconds: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 0.5,
            min_requests: 10,
            reset_timeout_seconds: 60,
            success_threshold: 3,
            window_seconds: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub max_memory_mb: u64,
    pub max_language_pairs: usize,
    pub eviction_threshold: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_mb: 256,
            max_language_pairs: 10,
            eviction_threshold: 0.8,
        }
    }
}

impl MemorySection {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub use_lock_files: bool,
    pub lock_timeout_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            use_lock_files: true,
            lock_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON or TOML file (chosen by extension) and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_json_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.word_cache_size == 0 {
            return Err(ConfigError::invalid("cache.word_cache_size", "must be > 0"));
        }
        if self.cache.phrase_cache_size == 0 {
            return Err(ConfigError::invalid("cache.phrase_cache_size", "must be > 0"));
        }
        if self.cache.generic_cache_size == 0 {
            return Err(ConfigError::invalid("cache.generic_cache_size", "must be > 0"));
        }
        if self.security.rate_limiting && self.security.max_requests_per_minute == 0 {
            return Err(ConfigError::invalid(
                "security.max_requests_per_minute",
                "must be > 0 when rate limiting is enabled",
            ));
        }
        let health = &self.health_monitoring;
        if !(health.error_threshold > 0.0 && health.error_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "health_monitoring.error_threshold",
                format!("{} is outside (0, 1]", health.error_threshold),
            ));
        }
        if health.min_requests == 0 {
            return Err(ConfigError::invalid("health_monitoring.min_requests", "must be > 0"));
        }
        if health.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "health_monitoring.success_threshold",
                "must be > 0",
            ));
        }
        let memory = &self.memory;
        if !(memory.eviction_threshold > 0.0 && memory.eviction_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "memory.eviction_threshold",
                format!("{} is outside (0, 1]", memory.eviction_threshold),
            ));
        }
        if memory.enabled && (memory.max_memory_mb == 0 || memory.max_language_pairs == 0) {
            return Err(ConfigError::invalid(
                "memory.max_memory_mb",
                "memory limits must be > 0 when memory management is enabled",
            ));
        }
        if self.degrade.enabled && self.degrade.allowed_layers.is_empty() {
            return Err(ConfigError::invalid(
                "degrade.allowed_layers",
                "degrade mode needs at least one allowed layer",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "queue": { "max_pending": 4 },
                "degrade": { "enabled": true, "allowed_layers": ["preProcessing", "dictionary"] },
                "health_monitoring": { "min_requests": 20 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.queue.max_pending, 4);
        assert_eq!(config.health_monitoring.min_requests, 20);
        assert_eq!(config.health_monitoring.error_threshold, 0.5);
        assert_eq!(
            config.degrade.allow_list(),
            Some(&[LayerType::PreProcessing, LayerType::Dictionary][..])
        );
        assert_eq!(config.cache.word_cache_size, 5000);
        config.validate().unwrap();
    }

    #[test]
    fn toml_sections_parse() {
        let config = EngineConfig::from_toml_str(
            r#"
            [security]
            rate_limiting = true
            max_requests_per_minute = 120

            [timeouts]
            translate_ms = 250
            "#,
        )
        .unwrap();
        assert!(config.security.rate_limiting);
        assert_eq!(config.security.max_requests_per_minute, 120);
        assert_eq!(config.timeouts.translate_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn invalid_threshold_names_key() {
        let mut config = EngineConfig::default();
        config.health_monitoring.error_threshold = 1.5;
        match config.validate() {
            Err(ConfigError::Invalid { key, .. }) => {
                assert_eq!(key, "health_monitoring.error_threshold")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[queue]\nmax_pending = 2\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().queue.max_pending, 2);

        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"memory": {"max_language_pairs": 3}}"#).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().memory.max_language_pairs, 3);
    }
}

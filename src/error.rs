//! Error types.
//! Fatal/structural failures are `EngineError`; expected degraded outcomes
//! (empty input, queue full, timeout) are values on `TranslationOutcome`.

use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::EngineState;

/// A record failed validation on write. `field` names the offending field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field `{field}`: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Errors from the storage and repository layer.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl RepositoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RepositoryError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Configuration load or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// A single layer's failure. Isolated by the pipeline, never fatal.
#[derive(Error, Debug, Clone)]
pub enum LayerError {
    #[error("layer processing failed: {0}")]
    Processing(String),

    #[error("layer data unavailable: {0}")]
    Data(String),

    #[error("layer panicked: {0}")]
    Panicked(String),
}

impl From<RepositoryError> for LayerError {
    fn from(e: RepositoryError) -> Self {
        LayerError::Data(e.to_string())
    }
}

/// Operator/programmer errors surfaced by the engine facade.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("no translation layers could be registered")]
    NoLayers,

    #[error("invalid engine state: {state} ({operation})")]
    InvalidState {
        state: EngineState,
        operation: &'static str,
    },

    #[error("engine has been disposed")]
    Disposed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = ValidationError::new("language_pair", "must match xx-yy");
        assert_eq!(err.field, "language_pair");
        assert!(err.to_string().contains("language_pair"));
        assert!(err.to_string().contains("xx-yy"));
    }

    #[test]
    fn repository_error_wraps_validation() {
        let err: RepositoryError = ValidationError::new("source_word", "empty").into();
        assert!(matches!(
            err,
            RepositoryError::Validation(ValidationError { field: "source_word", .. })
        ));
    }

    #[test]
    fn invalid_state_mentions_operation() {
        let err = EngineError::InvalidState {
            state: EngineState::Disposed,
            operation: "translate",
        };
        assert!(err.to_string().contains("Disposed"));
        assert!(err.to_string().contains("translate"));
    }
}

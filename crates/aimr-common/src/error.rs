//! Error types shared by the model factory and runtime adapter.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Main error type for model construction, persistence and configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ModelError {
    /// Invalid configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A model bundle could not be found at the given path.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Loading a serialized model failed.
    #[error("Failed to load model from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Saving a model failed.
    #[error("Failed to save model to {path}: {reason}")]
    SaveFailed { path: String, reason: String },

    /// Training a model whose weights are currently frozen.
    #[error("Model '{0}' is not trainable")]
    NotTrainable(&'static str),

    /// The requested backend is not available in this build.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Whether the error stems from user-provided configuration rather than
    /// a runtime failure.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ModelError::InvalidConfig(_) | ModelError::Toml(_) | ModelError::BackendUnavailable(_)
        )
    }
}

//! Error types for the training pipeline.
//!
//! Every failure in the core is fatal to the run except a preview that could
//! not be rendered; the variants otherwise only decide how it is reported and
//! which exit status the binary uses.

use aimr_common::ModelError;
use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Missing or invalid configuration, malformed dataset cache.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Live allocations grew between two training steps.
    #[error("Resource leak: live tensors grew from {previous} to {current}")]
    ResourceLeak { previous: usize, current: usize },

    /// Checkpoint save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// Image decode/encode failures
    #[error("Image error at '{path}': {message}")]
    Image { message: String, path: String },

    /// Preview rendering failures
    #[error("Preview error: {0}")]
    Preview(String),

    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// Model construction or persistence failures
    #[error("Model error: {0}")]
    Model(String),
}

/// Result type alias for training operations
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Whether the training loop may log the error and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TrainError::Preview(_))
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            TrainError::Image { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            TrainError::Config(_) => 2,
            TrainError::ResourceLeak { .. } => 3,
            _ => 1,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<ModelError> for TrainError {
    fn from(err: ModelError) -> Self {
        if err.is_config() {
            return TrainError::Config(err.to_string());
        }
        match err {
            ModelError::Candle(e) => TrainError::Candle(e.to_string()),
            other => TrainError::Model(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        TrainError::Io {
            message: format!("JSON: {}", err),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(message: impl Into<String>, path: P) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating image errors
pub fn image_error<P: AsRef<std::path::Path>>(message: impl Into<String>, path: P) -> TrainError {
    TrainError::Image {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

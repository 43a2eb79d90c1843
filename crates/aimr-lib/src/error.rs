use thiserror::Error;

use aimr_common::ModelError;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Error, Debug)]
pub enum LibError {
    #[error("generator not loaded; call load() first")]
    NotLoaded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LibError {
    /// The cached bundle is absent or unreadable, so a remote fetch may help.
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            LibError::Model(ModelError::ModelNotFound(_)) | LibError::Model(ModelError::LoadFailed { .. })
        )
    }
}

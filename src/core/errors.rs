//! Custom error types for translation operations

use thiserror::Error;

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
    },

    /// Required model file could not be fetched
    #[error("Download error: {file} - {message}")]
    DownloadError {
        file: String,
        message: String,
    },

    /// Base model or adapter could not be loaded
    #[error("Model load error: {message}")]
    ModelLoadError {
        message: String,
    },

    /// Caller supplied unusable input
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
    },

    /// Tokenizer failed to encode or decode
    #[error("Tokenizer error: {message}")]
    TokenizerError {
        message: String,
    },

    /// Generation budget exhausted
    #[error("Translation timeout")]
    TimeoutError,

    /// Generation was abandoned by the caller
    #[error("Translation cancelled")]
    Cancelled,

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Tensor runtime error
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    /// Model hub error
    #[error("Hub error: {0}")]
    HubError(#[from] hf_hub::api::sync::ApiError),
}

impl TranslationError {
    /// Shorthand for an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        TranslationError::InvalidInput {
            message: message.into(),
        }
    }

    /// Shorthand for a model load error
    pub fn model_load(message: impl Into<String>) -> Self {
        TranslationError::ModelLoadError {
            message: message.into(),
        }
    }

    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TranslationError::ConfigError {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for TranslationError {
    fn from(err: anyhow::Error) -> Self {
        TranslationError::InternalError(err.to_string())
    }
}

impl From<tokenizers::Error> for TranslationError {
    fn from(err: tokenizers::Error) -> Self {
        TranslationError::TokenizerError {
            message: err.to_string(),
        }
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;

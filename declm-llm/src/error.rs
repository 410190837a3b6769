//! Error types for the declm-llm crate.

use std::path::PathBuf;

use declm_core::ConfigError;

/// Top-level error type for LLM model operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Backbone error for '{model}': {message}")]
    Backbone { model: String, message: String },

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Feature '{name}' error: {message}")]
    Feature { name: String, message: String },

    #[error("Input features {actual:?} do not match configured input features {expected:?}")]
    InputMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Checksum mismatch for {}: expected {expected}, found {found}", path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl LlmError {
    pub fn backbone(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backbone {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::Adapter(msg.into())
    }

    pub fn feature(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Feature {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

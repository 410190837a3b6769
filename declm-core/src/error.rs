//! Configuration error taxonomy.
//!
//! Every variant is fatal: a model whose configuration fails one of these
//! checks is never built.

use std::path::PathBuf;

/// Errors raised while reading or validating declarative configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Only a single output feature is supported, got {count}")]
    TooManyOutputFeatures { count: usize },

    #[error("No output feature configured")]
    MissingOutputFeature,

    #[error("Exactly one input feature is supported, got {count}")]
    InputFeatureCount { count: usize },

    #[error("Feature name '{name}' conflicts with a reserved attribute of the feature container")]
    ReservedFeatureName { name: String },

    #[error("Duplicate feature name '{name}'")]
    DuplicateFeatureName { name: String },

    #[error("Unsupported model type '{found}', expected '{expected}'")]
    ModelType { found: String, expected: String },

    #[error(
        "Context length {context_len} is too small for max_new_tokens {max_new_tokens} plus a margin of {margin}"
    )]
    ContextTooSmall {
        context_len: usize,
        max_new_tokens: usize,
        margin: usize,
    },

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unsupported config file format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

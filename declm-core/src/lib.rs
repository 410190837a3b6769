//! # declm-core
//!
//! Shared foundation for the declm workspace: the declarative model schema,
//! layered runtime configuration, configuration errors, atomic persistence
//! helpers, the process data cache and tracing setup.

pub mod cache;
pub mod config;
pub mod error;
pub mod persistence;
pub mod schema;
pub mod telemetry;

// Re-export commonly used types at the crate root.
pub use cache::{CachedDataset, DataCache};
pub use config::{BackboneSettings, DeviceMap, LoggingConfig, Precision, RuntimeConfig};
pub use error::ConfigError;
pub use schema::{
    AdapterConfig, FeatureType, GenerationConfig, InputFeatureConfig, LoraConfig, LossConfig,
    ModelConfig, OutputFeatureConfig, PrefixTuningConfig, PromptTuningConfig, MODEL_TYPE_LLM,
};

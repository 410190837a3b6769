//! # declm-llm
//!
//! Causal language model component for declm. Wraps a pretrained backbone,
//! optionally with a parameter-efficient adapter, and exposes it through the
//! framework's model contract: forward, predictions, metrics, eval loss,
//! save and load.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use declm_core::ModelConfig;
//! use declm_llm::mock::{MockAdapterProvider, MockBackboneProvider, MockFeatureFactory};
//! use declm_llm::{LlmModel, ModelContext};
//!
//! # fn main() -> declm_llm::Result<()> {
//! let config = ModelConfig::from_yaml_str(
//!     "model_name: mock/tiny\n\
//!      input_features: [{name: prompt, type: text}]\n\
//!      output_features: [{name: answer, type: text}]\n",
//! )?;
//! let context = ModelContext::new(
//!     Arc::new(MockBackboneProvider::with_vocab(32)),
//!     Arc::new(MockAdapterProvider::new()),
//!     Arc::new(MockFeatureFactory::new()),
//! );
//! let model = LlmModel::new(config, context)?;
//! assert_eq!(model.model_type(), "llm");
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backbone;
pub mod error;
pub mod features;
pub mod generation;
pub mod metrics;
pub mod mock;
pub mod model;
pub mod output;

pub use adapter::{AdapterProvider, PeftConfig, PeftModel, PeftType, TrainableParameters};
pub use backbone::{BackboneConfig, BackboneProvider, CausalLm, GenerationOutput, LoadOptions};
pub use error::{LlmError, Result};
pub use features::{FeatureDecoder, FeatureFactory, InputFeature, OutputFeature};
pub use generation::GenerationPolicy;
pub use metrics::MeanMetric;
pub use model::{LlmModel, ModelArgs, ModelMode, ModelContext};
pub use output::{
    BatchValue, FeatureInputs, FeatureTensors, ForwardInput, ForwardOutput, OutputKey, Predictions,
    Targets,
};

//! Input/output feature contracts and the feature builder.
//!
//! Feature encoders, decoders, losses and metrics are implemented by the
//! surrounding framework; the LLM model reaches them only through the traits
//! below.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Tensor;
use declm_core::schema::{InputFeatureConfig, OutputFeatureConfig, RESERVED_FEATURE_NAMES};
use declm_core::{ConfigError, FeatureType};

use crate::backbone::GenerationOutput;
use crate::error::Result;
use crate::output::{FeatureTensors, OutputKey};

/// An input feature. For an LLM it only names the token tensor in a batch.
pub trait InputFeature: Send + Sync {
    fn name(&self) -> &str;
    fn feature_type(&self) -> FeatureType;
}

/// Turns raw model outputs into an output feature's tensors.
pub trait FeatureDecoder: Send + Sync {
    /// Fine-tuning path: decode `[batch, input_size]` averaged logits.
    fn decode_logits(&self, logits: &Tensor) -> Result<Tensor>;

    /// Generation path: decode generated sequences and step scores.
    /// `llm_inputs` are the prompt ids, used to strip the echoed prompt.
    fn decode_generated(
        &self,
        generated: &GenerationOutput,
        llm_inputs: &Tensor,
    ) -> Result<FeatureTensors>;
}

/// An output feature with its decoder, weighted loss and metrics.
pub trait OutputFeature: Send + Sync {
    fn name(&self) -> &str;
    fn feature_type(&self) -> FeatureType;
    fn input_size(&self) -> usize;
    fn decoder(&self) -> Arc<dyn FeatureDecoder>;
    fn loss_weight(&self) -> f64;

    /// Scalar evaluation loss for one batch.
    fn eval_loss(&self, targets: &Tensor, predictions: &FeatureTensors) -> Result<Tensor>;

    fn update_metrics(&mut self, targets: &Tensor, predictions: &FeatureTensors) -> Result<()>;

    /// Build this feature's prediction structure from fine-tuning outputs.
    fn predictions(
        &self,
        outputs: &BTreeMap<OutputKey, Tensor>,
        feature_name: &str,
    ) -> Result<FeatureTensors>;
}

/// Constructs features from their configs.
pub trait FeatureFactory: Send + Sync {
    fn build_input(&self, config: &InputFeatureConfig) -> Result<Box<dyn InputFeature>>;

    fn build_output(
        &self,
        config: &OutputFeatureConfig,
        input_size: usize,
    ) -> Result<Box<dyn OutputFeature>>;
}

/// Insertion-ordered features keyed by name.
pub struct FeatureCollection<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for FeatureCollection<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> FeatureCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feature. Reserved and duplicate names are rejected.
    pub fn insert(&mut self, name: impl Into<String>, feature: T) -> std::result::Result<(), ConfigError> {
        let name = name.into();
        if RESERVED_FEATURE_NAMES.contains(&name.as_str()) {
            return Err(ConfigError::ReservedFeatureName { name });
        }
        if self.contains(&name) {
            return Err(ConfigError::DuplicateFeatureName { name });
        }
        self.entries.push((name, feature));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn first(&self) -> Option<(&str, &T)> {
        self.entries.first().map(|(n, f)| (n.as_str(), f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.entries.iter_mut().map(|(n, f)| (n.as_str(), f))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type InputFeatures = FeatureCollection<Box<dyn InputFeature>>;
pub type OutputFeatures = FeatureCollection<Box<dyn OutputFeature>>;

pub fn build_inputs(
    factory: &dyn FeatureFactory,
    configs: &[InputFeatureConfig],
) -> Result<InputFeatures> {
    let mut features = InputFeatures::new();
    for config in configs {
        let feature = factory.build_input(config)?;
        features.insert(config.name.clone(), feature)?;
    }
    Ok(features)
}

/// Build the single output feature with its decoder input bound to
/// `input_size`.
///
/// Callers pass the backbone vocabulary size here, not the tokenizer's: the
/// LM head may be wider than the tokenizer vocabulary.
pub fn build_outputs(
    factory: &dyn FeatureFactory,
    configs: &[OutputFeatureConfig],
    input_size: usize,
) -> Result<OutputFeatures> {
    let config = match configs {
        [] => return Err(ConfigError::MissingOutputFeature.into()),
        [only] => only,
        _ => {
            return Err(ConfigError::TooManyOutputFeatures {
                count: configs.len(),
            }
            .into());
        }
    };
    let mut config = config.clone();
    config.input_size = Some(input_size);

    let feature = factory.build_output(&config, input_size)?;
    let mut features = OutputFeatures::new();
    features.insert(config.name.clone(), feature)?;
    Ok(features)
}

/// Data augmentation pipelines keyed by input feature name.
///
/// LLM inputs are token ids, so models of this type declare none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AugmentationPipelines {
    pipelines: BTreeMap<String, Vec<String>>,
}

impl AugmentationPipelines {
    pub fn new(pipelines: BTreeMap<String, Vec<String>>) -> Self {
        Self { pipelines }
    }

    pub fn get(&self, feature: &str) -> Option<&[String]> {
        self.pipelines.get(feature).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

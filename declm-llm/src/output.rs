//! Batch inputs and model outputs.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::error::{LlmError, Result};

/// Tensor name under which the fine-tuning path stores decoder output.
pub const LOGITS: &str = "logits";
/// Tensor name every output feature uses for its decoded predictions.
pub const PREDICTIONS: &str = "predictions";
pub const PROBABILITIES: &str = "probabilities";

/// Address of one tensor produced for one output feature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputKey {
    pub feature: String,
    pub tensor: String,
}

impl OutputKey {
    pub fn new(feature: impl Into<String>, tensor: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            tensor: tensor.into(),
        }
    }

    pub fn logits(feature: impl Into<String>) -> Self {
        Self::new(feature, LOGITS)
    }
}

impl std::fmt::Display for OutputKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.feature, self.tensor)
    }
}

/// Named tensors belonging to one feature (`predictions`, `probabilities`, ...).
pub type FeatureTensors = BTreeMap<String, Tensor>;

/// Per-feature prediction structures keyed by output feature name.
pub type Predictions = BTreeMap<String, FeatureTensors>;

/// Targets keyed by output feature name.
pub type Targets = BTreeMap<String, Tensor>;

/// Result of [`crate::LlmModel::forward`].
#[derive(Debug, Clone)]
pub enum ForwardOutput {
    /// Fine-tuning path: decoder output addressed by feature and tensor name.
    Logits(BTreeMap<OutputKey, Tensor>),
    /// Generation path: decoded prediction structure per output feature.
    Generated(Predictions),
}

impl ForwardOutput {
    pub fn logits(&self, feature: &str) -> Option<&Tensor> {
        match self {
            Self::Logits(map) => map.get(&OutputKey::logits(feature)),
            Self::Generated(_) => None,
        }
    }

    pub fn generated(&self, feature: &str) -> Option<&FeatureTensors> {
        match self {
            Self::Logits(_) => None,
            Self::Generated(map) => map.get(feature),
        }
    }
}

/// A batch value that is either already a tensor or a host array.
#[derive(Debug, Clone)]
pub enum BatchValue {
    Tensor(Tensor),
    /// Row-major `i64` data with its shape.
    Array { data: Vec<i64>, shape: Vec<usize> },
}

impl BatchValue {
    pub fn array(data: Vec<i64>, shape: Vec<usize>) -> Self {
        Self::Array { data, shape }
    }

    /// Tensors pass through; arrays are copied onto `device`.
    pub fn into_tensor(self, device: &Device) -> Result<Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            Self::Array { data, shape } => {
                let expected: usize = shape.iter().product();
                if expected != data.len() {
                    return Err(LlmError::shape(format!(
                        "array of {} values cannot have shape {shape:?}",
                        data.len()
                    )));
                }
                Ok(Tensor::from_vec(data, shape, device)?)
            }
        }
    }
}

impl From<Tensor> for BatchValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

/// Inputs keyed by input feature name.
pub type FeatureInputs = BTreeMap<String, Tensor>;

/// What a forward call receives: inputs alone, or inputs with targets.
#[derive(Debug, Clone)]
pub enum ForwardInput {
    Inputs(FeatureInputs),
    WithTargets(FeatureInputs, BTreeMap<String, BatchValue>),
}

impl ForwardInput {
    /// Split into inputs and tensor-converted targets.
    pub fn into_parts(self, device: &Device) -> Result<(FeatureInputs, Option<Targets>)> {
        match self {
            Self::Inputs(inputs) => Ok((inputs, None)),
            Self::WithTargets(inputs, targets) => {
                let targets = targets
                    .into_iter()
                    .map(|(name, value)| Ok((name, value.into_tensor(device)?)))
                    .collect::<Result<Targets>>()?;
                Ok((inputs, Some(targets)))
            }
        }
    }
}

impl From<FeatureInputs> for ForwardInput {
    fn from(inputs: FeatureInputs) -> Self {
        Self::Inputs(inputs)
    }
}

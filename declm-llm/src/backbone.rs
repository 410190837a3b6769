//! Pretrained causal-LM backbones.
//!
//! The model runtime (weights, tokenizer, transformer) lives behind
//! [`BackboneProvider`] and [`CausalLm`]; this module only decides how a
//! backbone is requested and what is read back from its metadata.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use declm_core::{BackboneSettings, DeviceMap, GenerationConfig, Precision};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LlmError, Result};

/// Metadata published by a loaded backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Width of the LM head. May exceed the tokenizer vocabulary when the
    /// embedding matrix was padded.
    pub vocab_size: usize,
    #[serde(default)]
    pub hidden_size: Option<usize>,
    #[serde(default)]
    pub max_sequence_length: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
}

impl BackboneConfig {
    /// Maximum number of input + generated tokens the backbone handles.
    ///
    /// `max_sequence_length` wins over `max_position_embeddings`; `default`
    /// applies when neither is published.
    pub fn context_len(&self, default: usize) -> usize {
        self.max_sequence_length
            .or(self.max_position_embeddings)
            .unwrap_or(default)
    }
}

/// Placement and precision requested from a [`BackboneProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub dtype: DType,
    pub device_map: DeviceMap,
    /// Memory cap in bytes keyed by device ordinal.
    pub max_memory: BTreeMap<usize, u64>,
    pub low_cpu_mem_usage: bool,
}

impl LoadOptions {
    pub fn from_settings(settings: &BackboneSettings) -> Result<Self> {
        Ok(Self {
            dtype: precision_dtype(settings.precision),
            device_map: settings.device_map,
            max_memory: settings.max_memory()?,
            low_cpu_mem_usage: settings.low_cpu_mem_usage,
        })
    }
}

pub fn precision_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Half => DType::F16,
        Precision::Bfloat16 => DType::BF16,
        Precision::Full => DType::F32,
    }
}

/// Result of an autoregressive generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt followed by generated tokens, `[batch, prompt + generated]`.
    pub sequences: Tensor,
    /// One `[batch, vocab]` score tensor per generated step.
    pub scores: Vec<Tensor>,
}

impl GenerationOutput {
    /// Cut every tensor loose from any autograd graph.
    pub fn detach(self) -> Self {
        Self {
            sequences: self.sequences.detach(),
            scores: self.scores.iter().map(Tensor::detach).collect(),
        }
    }

    pub fn num_steps(&self) -> usize {
        self.scores.len()
    }
}

/// A loaded causal language model.
pub trait CausalLm: Send + Sync {
    /// Identifier the backbone was loaded from.
    fn model_id(&self) -> &str;

    fn config(&self) -> &BackboneConfig;

    /// Primary compute device; inputs are moved here before every call.
    fn device(&self) -> &Device;

    /// Next-token logits for `input_ids` (`[batch, seq]`, `u32`), shaped
    /// `[batch, seq', vocab]`. `seq'` may exceed `seq` when virtual tokens
    /// are prepended.
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Autoregressive generation bounded by `config.max_new_tokens`.
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput>;

    /// Token embeddings, `[batch, seq, hidden]`.
    fn input_embeddings(&self, _input_ids: &Tensor) -> Result<Tensor> {
        Err(LlmError::Unsupported(format!(
            "{} does not expose input embeddings",
            self.model_id()
        )))
    }

    /// Logits computed from precomputed embeddings instead of token ids.
    fn forward_embeds(&self, _embeds: &Tensor) -> Result<Tensor> {
        Err(LlmError::Unsupported(format!(
            "{} does not accept input embeddings",
            self.model_id()
        )))
    }

    /// Auxiliary losses (regularisers) produced by the last forward pass.
    fn losses(&self) -> Result<Vec<Tensor>> {
        Ok(Vec::new())
    }

    fn num_parameters(&self) -> usize;
}

/// Loads pretrained backbones by identifier.
pub trait BackboneProvider: Send + Sync {
    fn load(&self, model_id: &str, options: &LoadOptions) -> Result<Box<dyn CausalLm>>;
}

/// A backbone together with its resolved context length.
pub struct LoadedBackbone {
    pub model: Box<dyn CausalLm>,
    pub context_len: usize,
}

/// Load `model_id` and resolve its context length.
///
/// Provider failures are returned unchanged.
pub fn load_backbone(
    provider: &dyn BackboneProvider,
    model_id: &str,
    options: &LoadOptions,
    default_context_len: usize,
) -> Result<LoadedBackbone> {
    info!(model = model_id, dtype = ?options.dtype, device_map = ?options.device_map, "Loading large language model");
    let model = provider.load(model_id, options)?;
    let context_len = model.config().context_len(default_context_len);
    info!(
        model = model_id,
        context_len,
        vocab_size = model.config().vocab_size,
        "Loaded large language model"
    );
    Ok(LoadedBackbone { model, context_len })
}

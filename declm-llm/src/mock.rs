//! Deterministic in-process implementations of the runtime seams.
//!
//! Used by tests and demos that need a working model without downloading
//! weights. The mock backbone embeds tokens with fixed sinusoidal tables and
//! decodes greedily; the mock adapter implements prompt tuning only.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{D, DType, Device, Tensor};
use declm_core::config::DEFAULT_CONTEXT_LEN;
use declm_core::{FeatureType, GenerationConfig, InputFeatureConfig, OutputFeatureConfig};

use crate::adapter::{AdapterProvider, PeftConfig, PeftModel, PeftType, TrainableParameters};
use crate::backbone::{BackboneConfig, BackboneProvider, CausalLm, GenerationOutput, LoadOptions};
use crate::error::{LlmError, Result};
use crate::features::{FeatureDecoder, FeatureFactory, InputFeature, OutputFeature};
use crate::output::{FeatureTensors, LOGITS, OutputKey, PREDICTIONS, PROBABILITIES};

/// Hidden width used when a mock backbone config leaves it unset.
pub const DEFAULT_MOCK_HIDDEN: usize = 16;
/// Weight file written by [`MockAdapterProvider`] models.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
const PROMPT_TENSOR: &str = "prompt_embeddings";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `[rows, cols]` f32 table of `0.5 * sin(0.37 * i + phase)`.
fn sin_table(rows: usize, cols: usize, phase: f64, device: &Device) -> Result<Tensor> {
    let n = (rows * cols) as u32;
    Ok(Tensor::arange(0u32, n, device)?
        .to_dtype(DType::F32)?
        .affine(0.37, phase)?
        .sin()?
        .affine(0.5, 0.0)?
        .reshape((rows, cols))?)
}

/// A call observed by mock backbones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackboneCall {
    Load { model_id: String },
    Forward { shape: Vec<usize> },
    Embed { shape: Vec<usize> },
    Generate {
        shape: Vec<usize>,
        mask_shape: Option<Vec<usize>>,
        max_new_tokens: usize,
    },
}

pub type CallLog = Arc<Mutex<Vec<BackboneCall>>>;

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

/// A tiny causal LM: embedding lookup followed by a tied-width linear head.
pub struct MockCausalLm {
    model_id: String,
    config: BackboneConfig,
    hidden: usize,
    dtype: DType,
    device: Device,
    embeddings: Tensor,
    head: Tensor,
    calls: CallLog,
}

impl MockCausalLm {
    pub fn new(model_id: &str, mut config: BackboneConfig, dtype: DType, calls: CallLog) -> Result<Self> {
        let device = Device::Cpu;
        let hidden = *config.hidden_size.get_or_insert(DEFAULT_MOCK_HIDDEN);
        let embeddings = sin_table(config.vocab_size, hidden, 0.0, &device)?;
        let head = sin_table(config.vocab_size, hidden, 1.1, &device)?
            .t()?
            .contiguous()?;
        Ok(Self {
            model_id: model_id.to_string(),
            config,
            hidden,
            dtype,
            device,
            embeddings,
            head,
            calls,
        })
    }

    fn record(&self, call: BackboneCall) {
        lock(&self.calls).push(call);
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let flat = input_ids.flatten_all()?.to_dtype(DType::U32)?;
        Ok(self
            .embeddings
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.hidden))?)
    }

    /// f32 logits for embeddings, `[batch, seq, vocab]`.
    fn head_logits(&self, embeds: &Tensor) -> Result<Tensor> {
        Ok(embeds.to_dtype(DType::F32)?.broadcast_matmul(&self.head)?)
    }
}

impl CausalLm for MockCausalLm {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.record(BackboneCall::Forward {
            shape: input_ids.dims().to_vec(),
        });
        let logits = self.head_logits(&self.embed(input_ids)?)?;
        Ok(logits.to_dtype(self.dtype)?)
    }

    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        self.record(BackboneCall::Generate {
            shape: input_ids.dims().to_vec(),
            mask_shape: attention_mask.map(|m| m.dims().to_vec()),
            max_new_tokens: config.max_new_tokens,
        });
        if let Some(mask) = attention_mask
            && mask.dims() != input_ids.dims()
        {
            return Err(LlmError::shape(format!(
                "attention mask {:?} does not match input ids {:?}",
                mask.dims(),
                input_ids.dims()
            )));
        }
        let (_, prompt_len) = input_ids.dims2()?;
        if prompt_len == 0 {
            return Err(LlmError::shape("cannot generate from an empty prompt"));
        }
        let context_len = self.config.context_len(DEFAULT_CONTEXT_LEN);
        if prompt_len.saturating_add(config.max_new_tokens) > context_len {
            return Err(LlmError::backbone(
                &self.model_id,
                format!(
                    "{prompt_len} prompt tokens + {} new tokens exceed context length {context_len}",
                    config.max_new_tokens
                ),
            ));
        }

        let mut sequences = input_ids.to_dtype(DType::U32)?;
        let mut scores = Vec::with_capacity(config.max_new_tokens);
        for _ in 0..config.max_new_tokens {
            let logits = self.head_logits(&self.embed(&sequences)?)?;
            let last = logits.narrow(1, sequences.dim(1)?.saturating_sub(1), 1)?.squeeze(1)?;
            let next = last.argmax_keepdim(D::Minus1)?;
            sequences = Tensor::cat(&[&sequences, &next], 1)?;
            scores.push(last);
        }
        Ok(GenerationOutput { sequences, scores })
    }

    fn input_embeddings(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.record(BackboneCall::Embed {
            shape: input_ids.dims().to_vec(),
        });
        self.embed(input_ids)
    }

    fn forward_embeds(&self, embeds: &Tensor) -> Result<Tensor> {
        Ok(self.head_logits(embeds)?.to_dtype(self.dtype)?)
    }

    fn num_parameters(&self) -> usize {
        2 * self.config.vocab_size * self.hidden
    }
}

/// Serves [`MockCausalLm`] backbones and records every call made to them.
pub struct MockBackboneProvider {
    config: BackboneConfig,
    dtype: Option<DType>,
    unavailable: Vec<String>,
    calls: CallLog,
}

impl MockBackboneProvider {
    pub fn new(config: BackboneConfig) -> Self {
        Self {
            config,
            dtype: None,
            unavailable: Vec::new(),
            calls: CallLog::default(),
        }
    }

    /// A backbone with `vocab_size` outputs and no published context length.
    pub fn with_vocab(vocab_size: usize) -> Self {
        Self::new(BackboneConfig {
            vocab_size,
            hidden_size: Some(DEFAULT_MOCK_HIDDEN),
            max_sequence_length: None,
            max_position_embeddings: None,
        })
    }

    /// Produce logits in `dtype` regardless of the requested precision.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Fail loads of `model_id`.
    pub fn with_unavailable(mut self, model_id: impl Into<String>) -> Self {
        self.unavailable.push(model_id.into());
        self
    }

    pub fn calls(&self) -> Vec<BackboneCall> {
        lock(&self.calls).clone()
    }

    pub fn load_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackboneCall::Load { .. }))
            .count()
    }
}

impl BackboneProvider for MockBackboneProvider {
    fn load(&self, model_id: &str, options: &LoadOptions) -> Result<Box<dyn CausalLm>> {
        lock(&self.calls).push(BackboneCall::Load {
            model_id: model_id.to_string(),
        });
        if self.unavailable.iter().any(|id| id == model_id) {
            return Err(LlmError::backbone(model_id, "model not found"));
        }
        let dtype = self.dtype.unwrap_or(options.dtype);
        Ok(Box::new(MockCausalLm::new(
            model_id,
            self.config.clone(),
            dtype,
            Arc::clone(&self.calls),
        )?))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Prompt tuning: learned virtual-token embeddings prepended to the input.
pub struct MockPromptTunedLm {
    base: Box<dyn CausalLm>,
    peft_config: PeftConfig,
    prompt: Tensor,
}

impl CausalLm for MockPromptTunedLm {
    fn model_id(&self) -> &str {
        self.base.model_id()
    }

    fn config(&self) -> &BackboneConfig {
        self.base.config()
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let embeds = self.base.input_embeddings(input_ids)?;
        let (batch, _, hidden) = embeds.dims3()?;
        let (virtual_tokens, _) = self.prompt.dims2()?;
        let prompt = self
            .prompt
            .to_dtype(embeds.dtype())?
            .unsqueeze(0)?
            .broadcast_as((batch, virtual_tokens, hidden))?
            .contiguous()?;
        let embeds = Tensor::cat(&[&prompt, &embeds], 1)?;
        self.base.forward_embeds(&embeds)
    }

    /// Generation runs on the base model; virtual tokens are not applied.
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<GenerationOutput> {
        self.base.generate(input_ids, attention_mask, config)
    }

    /// An L2 penalty on the virtual-token embeddings.
    fn losses(&self) -> Result<Vec<Tensor>> {
        Ok(vec![self.prompt.sqr()?.mean_all()?.affine(0.01, 0.0)?])
    }

    fn num_parameters(&self) -> usize {
        self.base.num_parameters() + self.prompt.elem_count()
    }
}

impl PeftModel for MockPromptTunedLm {
    fn peft_config(&self) -> &PeftConfig {
        &self.peft_config
    }

    fn trainable_parameters(&self) -> TrainableParameters {
        TrainableParameters {
            trainable: self.prompt.elem_count(),
            total: self.num_parameters(),
        }
    }

    fn save_pretrained(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let path = dir.join(ADAPTER_WEIGHTS_FILE);
        let tensors = HashMap::from([(PROMPT_TENSOR.to_string(), self.prompt.clone())]);
        candle_core::safetensors::save(&tensors, &path)?;
        Ok(vec![path])
    }
}

/// Wraps backbones with prompt tuning. Each wrap draws a fresh initialisation.
#[derive(Default)]
pub struct MockAdapterProvider {
    wraps: AtomicUsize,
}

impl MockAdapterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap_count(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }
}

fn prompt_shape(backbone: &dyn CausalLm, config: &PeftConfig) -> Result<(usize, usize)> {
    let prompt = config.prompt_tuning().ok_or_else(|| {
        LlmError::Unsupported(format!("mock adapter cannot build {}", config.peft_type))
    })?;
    let hidden = backbone
        .config()
        .hidden_size
        .ok_or_else(|| LlmError::adapter("backbone does not publish a hidden size"))?;
    if let Some(token_dim) = prompt.token_dim
        && token_dim != hidden
    {
        return Err(LlmError::adapter(format!(
            "token_dim {token_dim} does not match backbone hidden size {hidden}"
        )));
    }
    Ok((prompt.num_virtual_tokens, hidden))
}

impl AdapterProvider for MockAdapterProvider {
    fn supports(&self, peft_type: PeftType) -> bool {
        peft_type == PeftType::PromptTuning
    }

    fn wrap(&self, backbone: Box<dyn CausalLm>, config: &PeftConfig) -> Result<Box<dyn PeftModel>> {
        let (virtual_tokens, hidden) = prompt_shape(backbone.as_ref(), config)?;
        let seed = self.wraps.fetch_add(1, Ordering::SeqCst);
        let prompt = sin_table(virtual_tokens, hidden, 0.5 + 1.7 * seed as f64, backbone.device())?;
        Ok(Box::new(MockPromptTunedLm {
            base: backbone,
            peft_config: config.clone(),
            prompt,
        }))
    }

    fn load(
        &self,
        backbone: Box<dyn CausalLm>,
        config: &PeftConfig,
        dir: &Path,
    ) -> Result<Box<dyn PeftModel>> {
        let (virtual_tokens, hidden) = prompt_shape(backbone.as_ref(), config)?;
        let mut tensors = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), backbone.device())?;
        let prompt = tensors
            .remove(PROMPT_TENSOR)
            .ok_or_else(|| LlmError::adapter(format!("{ADAPTER_WEIGHTS_FILE} has no {PROMPT_TENSOR}")))?;
        if prompt.dims() != [virtual_tokens, hidden] {
            return Err(LlmError::adapter(format!(
                "saved prompt has shape {:?}, expected [{virtual_tokens}, {hidden}]",
                prompt.dims()
            )));
        }
        Ok(Box::new(MockPromptTunedLm {
            base: backbone,
            peft_config: config.clone(),
            prompt,
        }))
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Shapes seen by one `update_metrics` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricUpdate {
    pub feature: String,
    pub target_shape: Vec<usize>,
    pub prediction_shape: Vec<usize>,
}

pub type MetricLog = Arc<Mutex<Vec<MetricUpdate>>>;

fn record_update(log: &MetricLog, feature: &str, targets: &Tensor, predictions: &FeatureTensors) -> Result<()> {
    let predicted = predictions
        .get(PREDICTIONS)
        .ok_or_else(|| LlmError::feature(feature, "no predictions to score"))?;
    lock(log).push(MetricUpdate {
        feature: feature.to_string(),
        target_shape: targets.dims().to_vec(),
        prediction_shape: predicted.dims().to_vec(),
    });
    Ok(())
}

fn logits_for<'a>(outputs: &'a BTreeMap<OutputKey, Tensor>, feature: &str) -> Result<&'a Tensor> {
    outputs
        .get(&OutputKey::logits(feature))
        .ok_or_else(|| LlmError::feature(feature, "no logits in forward outputs"))
}

fn zero_loss() -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?)
}

pub struct MockInputFeature {
    name: String,
    feature_type: FeatureType,
}

impl InputFeature for MockInputFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_type(&self) -> FeatureType {
        self.feature_type
    }
}

/// Decodes token logits and generated sequences for text outputs.
pub struct MockTextDecoder {
    input_size: usize,
}

impl FeatureDecoder for MockTextDecoder {
    fn decode_logits(&self, logits: &Tensor) -> Result<Tensor> {
        let (_, width) = logits.dims2()?;
        if width != self.input_size {
            return Err(LlmError::shape(format!(
                "decoder expects {} logits per row, got {width}",
                self.input_size
            )));
        }
        Ok(logits.clone())
    }

    fn decode_generated(&self, generated: &GenerationOutput, llm_inputs: &Tensor) -> Result<FeatureTensors> {
        let prompt_len = llm_inputs.dim(1)?;
        let (batch, total) = generated.sequences.dims2()?;
        if total < prompt_len {
            return Err(LlmError::shape(format!(
                "generated {total} positions for a {prompt_len}-token prompt"
            )));
        }
        let predictions = generated.sequences.narrow(1, prompt_len, total - prompt_len)?;
        let (logits, probabilities) = if generated.scores.is_empty() {
            let empty = Tensor::zeros((batch, 0, self.input_size), DType::F32, llm_inputs.device())?;
            (empty.clone(), empty)
        } else {
            let logits = Tensor::stack(&generated.scores, 1)?.to_dtype(DType::F32)?;
            let probabilities = candle_nn::ops::softmax_last_dim(&logits)?;
            (logits, probabilities)
        };
        Ok(FeatureTensors::from([
            (PREDICTIONS.to_string(), predictions),
            (LOGITS.to_string(), logits),
            (PROBABILITIES.to_string(), probabilities),
        ]))
    }
}

/// A text output: per-position token predictions scored with cross entropy.
pub struct MockTextOutputFeature {
    name: String,
    input_size: usize,
    loss_weight: f64,
    decoder: Arc<MockTextDecoder>,
    updates: MetricLog,
}

impl OutputFeature for MockTextOutputFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_type(&self) -> FeatureType {
        FeatureType::Text
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn decoder(&self) -> Arc<dyn FeatureDecoder> {
        self.decoder.clone()
    }

    fn loss_weight(&self) -> f64 {
        self.loss_weight
    }

    /// Cross entropy over the positions present in both targets and logits.
    fn eval_loss(&self, targets: &Tensor, predictions: &FeatureTensors) -> Result<Tensor> {
        let logits = predictions
            .get(LOGITS)
            .ok_or_else(|| LlmError::feature(&self.name, "no logits to score"))?;
        let (batch, seq, vocab) = logits.dims3()?;
        let positions = seq.min(targets.dim(1)?);
        if positions == 0 {
            return zero_loss();
        }
        let inp = logits
            .narrow(1, 0, positions)?
            .contiguous()?
            .reshape((batch * positions, vocab))?
            .to_dtype(DType::F32)?;
        let target = targets
            .narrow(1, 0, positions)?
            .contiguous()?
            .to_dtype(DType::U32)?
            .reshape(batch * positions)?;
        Ok(candle_nn::loss::cross_entropy(&inp, &target)?)
    }

    fn update_metrics(&mut self, targets: &Tensor, predictions: &FeatureTensors) -> Result<()> {
        record_update(&self.updates, &self.name, targets, predictions)
    }

    fn predictions(
        &self,
        outputs: &BTreeMap<OutputKey, Tensor>,
        feature_name: &str,
    ) -> Result<FeatureTensors> {
        let logits = logits_for(outputs, feature_name)?.to_dtype(DType::F32)?;
        let predictions = logits.argmax_keepdim(D::Minus1)?;
        let probabilities = candle_nn::ops::softmax_last_dim(&logits)?.unsqueeze(1)?;
        Ok(FeatureTensors::from([
            (PREDICTIONS.to_string(), predictions),
            (LOGITS.to_string(), logits.unsqueeze(1)?),
            (PROBABILITIES.to_string(), probabilities),
        ]))
    }
}

pub struct MockCategoryDecoder {
    input_size: usize,
}

impl FeatureDecoder for MockCategoryDecoder {
    fn decode_logits(&self, logits: &Tensor) -> Result<Tensor> {
        let (_, width) = logits.dims2()?;
        if width != self.input_size {
            return Err(LlmError::shape(format!(
                "decoder expects {} logits per row, got {width}",
                self.input_size
            )));
        }
        Ok(logits.clone())
    }

    fn decode_generated(&self, _generated: &GenerationOutput, _llm_inputs: &Tensor) -> Result<FeatureTensors> {
        Err(LlmError::Unsupported(
            "category outputs cannot be decoded from generated text".into(),
        ))
    }
}

/// A category output: one class per row, scored with cross entropy.
pub struct MockCategoryOutputFeature {
    name: String,
    input_size: usize,
    loss_weight: f64,
    decoder: Arc<MockCategoryDecoder>,
    updates: MetricLog,
}

impl OutputFeature for MockCategoryOutputFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_type(&self) -> FeatureType {
        FeatureType::Category
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn decoder(&self) -> Arc<dyn FeatureDecoder> {
        self.decoder.clone()
    }

    fn loss_weight(&self) -> f64 {
        self.loss_weight
    }

    fn eval_loss(&self, targets: &Tensor, predictions: &FeatureTensors) -> Result<Tensor> {
        if !targets.device().is_cpu() {
            return Err(LlmError::feature(&self.name, "category loss runs on the cpu"));
        }
        let logits = predictions
            .get(LOGITS)
            .ok_or_else(|| LlmError::feature(&self.name, "no logits to score"))?
            .to_dtype(DType::F32)?;
        let target = targets.flatten_all()?.to_dtype(DType::U32)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &target)?)
    }

    fn update_metrics(&mut self, targets: &Tensor, predictions: &FeatureTensors) -> Result<()> {
        record_update(&self.updates, &self.name, targets, predictions)
    }

    fn predictions(
        &self,
        outputs: &BTreeMap<OutputKey, Tensor>,
        feature_name: &str,
    ) -> Result<FeatureTensors> {
        let logits = logits_for(outputs, feature_name)?.to_dtype(DType::F32)?;
        Ok(FeatureTensors::from([
            (PREDICTIONS.to_string(), logits.argmax(D::Minus1)?),
            (PROBABILITIES.to_string(), candle_nn::ops::softmax_last_dim(&logits)?),
            (LOGITS.to_string(), logits),
        ]))
    }
}

/// Builds mock text and category features and shares one metric log
/// across them.
#[derive(Default)]
pub struct MockFeatureFactory {
    updates: MetricLog,
}

impl MockFeatureFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric_updates(&self) -> Vec<MetricUpdate> {
        lock(&self.updates).clone()
    }
}

impl FeatureFactory for MockFeatureFactory {
    fn build_input(&self, config: &InputFeatureConfig) -> Result<Box<dyn InputFeature>> {
        Ok(Box::new(MockInputFeature {
            name: config.name.clone(),
            feature_type: config.feature_type,
        }))
    }

    fn build_output(&self, config: &OutputFeatureConfig, input_size: usize) -> Result<Box<dyn OutputFeature>> {
        let name = config.name.clone();
        let loss_weight = config.loss.weight;
        let updates = Arc::clone(&self.updates);
        match config.feature_type {
            FeatureType::Text => Ok(Box::new(MockTextOutputFeature {
                name,
                input_size,
                loss_weight,
                decoder: Arc::new(MockTextDecoder { input_size }),
                updates,
            })),
            FeatureType::Category => Ok(Box::new(MockCategoryOutputFeature {
                name,
                input_size,
                loss_weight,
                decoder: Arc::new(MockCategoryDecoder { input_size }),
                updates,
            })),
            other => Err(LlmError::Unsupported(format!(
                "mock features do not implement {other} outputs"
            ))),
        }
    }
}

//! The LLM model component.
//!
//! [`LlmModel`] owns a pretrained backbone, optionally wrapped with a PEFT
//! adapter, and the single input/output feature pair. Whether an adapter is
//! attached is decided once at construction and fixes the [`ModelMode`]:
//!
//! * [`ModelMode::FineTuning`]: forward passes average per-token logits and feed
//!   them to the output decoder; eval losses are tracked.
//! * [`ModelMode::ZeroShotGeneration`]: forward passes generate tokens and the
//!   decoder turns sequences and scores into predictions; no loss is tracked.

mod eval;
mod forward;
mod persist;

pub use eval::{pad_target_to, realign_target};
pub use persist::{AdapterManifest, MANIFEST_FILE, MODEL_WEIGHTS_DIR, WeightFile};

use std::sync::Arc;

use candle_core::Device;
use declm_core::schema::{InputFeatureConfig, OutputFeatureConfig};
use declm_core::{
    BackboneSettings, ConfigError, DataCache, ModelConfig, RuntimeConfig, MODEL_TYPE_LLM,
};
use tracing::{debug, info};

use crate::adapter::{AdapterProvider, PeftConfig, PeftModel, TrainableParameters, wrap_backbone};
use crate::backbone::{BackboneProvider, CausalLm, LoadOptions, LoadedBackbone, load_backbone};
use crate::error::Result;
use crate::features::{
    AugmentationPipelines, FeatureDecoder, FeatureFactory, InputFeatures, OutputFeature,
    OutputFeatures, build_inputs, build_outputs,
};
use crate::generation::GenerationPolicy;
use crate::metrics::MeanMetric;

/// Collaborators and settings a model is built with.
#[derive(Clone)]
pub struct ModelContext {
    pub backbones: Arc<dyn BackboneProvider>,
    pub adapters: Arc<dyn AdapterProvider>,
    pub features: Arc<dyn FeatureFactory>,
    /// Cleared once when the model is constructed.
    pub data_cache: DataCache,
    pub backbone_settings: BackboneSettings,
    pub random_seed: Option<u64>,
}

impl ModelContext {
    pub fn new(
        backbones: Arc<dyn BackboneProvider>,
        adapters: Arc<dyn AdapterProvider>,
        features: Arc<dyn FeatureFactory>,
    ) -> Self {
        Self {
            backbones,
            adapters,
            features,
            data_cache: DataCache::new(),
            backbone_settings: BackboneSettings::default(),
            random_seed: None,
        }
    }

    pub fn with_data_cache(mut self, cache: DataCache) -> Self {
        self.data_cache = cache;
        self
    }

    pub fn with_backbone_settings(mut self, settings: BackboneSettings) -> Self {
        self.backbone_settings = settings;
        self
    }

    /// Take backbone placement from a layered [`RuntimeConfig`].
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use declm_core::config::load_runtime_config;
    /// # use declm_llm::mock::{MockAdapterProvider, MockBackboneProvider, MockFeatureFactory};
    /// # use declm_llm::ModelContext;
    /// # fn main() -> declm_llm::Result<()> {
    /// let runtime = load_runtime_config(Some(std::path::Path::new(".")), None)?;
    /// let context = ModelContext::new(
    ///     Arc::new(MockBackboneProvider::with_vocab(32)),
    ///     Arc::new(MockAdapterProvider::new()),
    ///     Arc::new(MockFeatureFactory::new()),
    /// )
    /// .with_runtime_config(&runtime);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_runtime_config(self, runtime: &RuntimeConfig) -> Self {
        self.with_backbone_settings(runtime.backbone.clone())
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}

/// Inference regime, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    FineTuning,
    ZeroShotGeneration,
}

pub(crate) enum ModelState {
    FineTuning {
        model: Box<dyn PeftModel>,
        peft_config: PeftConfig,
    },
    ZeroShotGeneration {
        model: Box<dyn CausalLm>,
    },
}

impl ModelState {
    fn backbone(&self) -> &dyn CausalLm {
        match self {
            Self::FineTuning { model, .. } => model.as_ref(),
            Self::ZeroShotGeneration { model } => model.as_ref(),
        }
    }

    fn mode(&self) -> ModelMode {
        match self {
            Self::FineTuning { .. } => ModelMode::FineTuning,
            Self::ZeroShotGeneration { .. } => ModelMode::ZeroShotGeneration,
        }
    }
}

/// Arguments needed to rebuild an equivalent model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArgs {
    pub input_features: Vec<InputFeatureConfig>,
    pub output_features: Vec<OutputFeatureConfig>,
    pub random_seed: Option<u64>,
}

/// A causal LLM behind the framework's forward/predict/loss/save/load contract.
pub struct LlmModel {
    config: ModelConfig,
    context: ModelContext,
    state: ModelState,
    generation: GenerationPolicy,
    input_features: InputFeatures,
    output_features: OutputFeatures,
    input_name: String,
    output_name: String,
    output_decoder: Arc<dyn FeatureDecoder>,
    eval_loss_metric: MeanMetric,
    eval_additional_losses_metric: MeanMetric,
}

impl LlmModel {
    /// Build a model from its declarative config.
    ///
    /// The config is validated before anything is loaded. The backbone is
    /// then loaded, wrapped when an adapter is configured, and the features
    /// are built against the backbone's vocabulary size.
    pub fn new(config: ModelConfig, context: ModelContext) -> Result<Self> {
        config.validate()?;

        let options = LoadOptions::from_settings(&context.backbone_settings)?;
        let LoadedBackbone { model, context_len } = load_backbone(
            context.backbones.as_ref(),
            &config.model_name,
            &options,
            context.backbone_settings.default_context_len,
        )?;
        let vocab_size = model.config().vocab_size;

        let state = match &config.adapter {
            Some(adapter) => {
                let peft_config = PeftConfig::from_adapter(adapter, &config.model_name)?;
                let model = wrap_backbone(context.adapters.as_ref(), model, &peft_config)?;
                ModelState::FineTuning { model, peft_config }
            }
            None => ModelState::ZeroShotGeneration { model },
        };

        let generation = GenerationPolicy::new(config.generation.clone(), context_len)?;
        info!(
            context_len,
            max_new_tokens = generation.max_new_tokens(),
            max_input_length = generation.max_input_length(),
            mode = ?state.mode(),
            "Configured generation policy"
        );

        let input_features = build_inputs(context.features.as_ref(), &config.input_features)?;
        let output_features =
            build_outputs(context.features.as_ref(), &config.output_features, vocab_size)?;

        let input_name = input_features
            .first()
            .map(|(name, _)| name.to_string())
            .ok_or(ConfigError::InputFeatureCount { count: 0 })?;
        let (output_name, output_decoder) = output_features
            .first()
            .map(|(name, feature)| (name.to_string(), feature.decoder()))
            .ok_or(ConfigError::MissingOutputFeature)?;

        let cleared = context.data_cache.clear();
        debug!(cleared, "Reset data cache for new model");

        Ok(Self {
            config,
            context,
            state,
            generation,
            input_features,
            output_features,
            input_name,
            output_name,
            output_decoder,
            eval_loss_metric: MeanMetric::new(),
            eval_additional_losses_metric: MeanMetric::new(),
        })
    }

    pub fn model_type(&self) -> &'static str {
        MODEL_TYPE_LLM
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn mode(&self) -> ModelMode {
        self.state.mode()
    }

    pub fn generation(&self) -> &GenerationPolicy {
        &self.generation
    }

    pub fn context_len(&self) -> usize {
        self.generation.context_len()
    }

    pub fn max_input_length(&self) -> usize {
        self.generation.max_input_length()
    }

    pub fn backbone(&self) -> &dyn CausalLm {
        self.state.backbone()
    }

    pub fn device(&self) -> &Device {
        self.state.backbone().device()
    }

    /// Trainable parameter counts, when an adapter is attached.
    pub fn trainable_parameters(&self) -> Option<TrainableParameters> {
        match &self.state {
            ModelState::FineTuning { model, .. } => Some(model.trainable_parameters()),
            ModelState::ZeroShotGeneration { .. } => None,
        }
    }

    pub fn peft_config(&self) -> Option<&PeftConfig> {
        match &self.state {
            ModelState::FineTuning { peft_config, .. } => Some(peft_config),
            ModelState::ZeroShotGeneration { .. } => None,
        }
    }

    pub fn input_feature_names(&self) -> Vec<String> {
        self.input_features.names()
    }

    pub fn output_feature(&self, name: &str) -> Option<&dyn OutputFeature> {
        self.output_features.get(name).map(|f| f.as_ref())
    }

    pub fn args(&self) -> ModelArgs {
        ModelArgs {
            input_features: self.config.input_features.clone(),
            output_features: self.config.output_features.clone(),
            random_seed: self.context.random_seed,
        }
    }

    pub fn augmentation_pipelines(&self) -> AugmentationPipelines {
        AugmentationPipelines::default()
    }

    /// Running mean of the weighted eval loss.
    pub fn eval_loss_metric(&self) -> &MeanMetric {
        &self.eval_loss_metric
    }

    /// Running mean of the summed additional losses.
    pub fn eval_additional_losses_metric(&self) -> &MeanMetric {
        &self.eval_additional_losses_metric
    }

    /// Clear both running means; call at the start of an evaluation epoch.
    pub fn reset_metrics(&mut self) {
        self.eval_loss_metric.reset();
        self.eval_additional_losses_metric.reset();
    }
}

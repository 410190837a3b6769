//! Declarative model schema.
//!
//! A [`ModelConfig`] describes an LLM model: which pretrained backbone to
//! load, an optional parameter-efficient adapter, generation settings and the
//! input/output features. It is immutable once a model has been built from it.

use std::path::Path;

use figment::{
    providers::{Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Model type discriminator accepted by [`ModelConfig`].
pub const MODEL_TYPE_LLM: &str = "llm";

/// Names that cannot be used as feature names because the feature container
/// exposes attributes under them.
pub const RESERVED_FEATURE_NAMES: &[&str] = &[
    "clear",
    "eval",
    "forward",
    "items",
    "keys",
    "modules",
    "parameters",
    "pop",
    "state_dict",
    "to",
    "train",
    "training",
    "type",
    "update",
    "values",
];

/// Declarative description of an LLM model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Identifier of the pretrained causal LM (hub id or local path).
    pub model_name: String,
    /// Parameter-efficient fine-tuning adapter. `None` selects zero-shot generation.
    #[serde(default)]
    pub adapter: Option<AdapterConfig>,
    #[serde(default, alias = "generation_config")]
    pub generation: GenerationConfig,
    pub input_features: Vec<InputFeatureConfig>,
    pub output_features: Vec<OutputFeatureConfig>,
}

fn default_model_type() -> String {
    MODEL_TYPE_LLM.to_string()
}

impl ModelConfig {
    /// Load a model config from a YAML, JSON or TOML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let figment = match ext.as_deref() {
            Some("yaml") | Some("yml") => Figment::from(Yaml::file(path)),
            Some("json") => Figment::from(Json::file(path)),
            Some("toml") => Figment::from(Toml::file(path)),
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                });
            }
        };
        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the structural rules an LLM model relies on.
    ///
    /// Runs before any backbone is loaded, so a bad config never costs a
    /// model download.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_type != MODEL_TYPE_LLM {
            return Err(ConfigError::ModelType {
                found: self.model_type.clone(),
                expected: MODEL_TYPE_LLM.to_string(),
            });
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::invalid("model_name", "must not be empty"));
        }
        match self.output_features.len() {
            0 => return Err(ConfigError::MissingOutputFeature),
            1 => {}
            count => return Err(ConfigError::TooManyOutputFeatures { count }),
        }
        if self.input_features.len() != 1 {
            return Err(ConfigError::InputFeatureCount {
                count: self.input_features.len(),
            });
        }
        let names = self
            .input_features
            .iter()
            .map(|f| &f.name)
            .chain(self.output_features.iter().map(|f| &f.name));
        for name in names {
            if RESERVED_FEATURE_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::ReservedFeatureName { name: name.clone() });
            }
        }
        self.generation.validate()?;
        if let Some(adapter) = &self.adapter {
            adapter.validate()?;
        }
        Ok(())
    }
}

/// Feature data types understood by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Text,
    Category,
    Number,
    Binary,
    Sequence,
    Set,
    Vector,
}

impl FeatureType {
    pub fn is_text(self) -> bool {
        matches!(self, Self::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Category => "category",
            Self::Number => "number",
            Self::Binary => "binary",
            Self::Sequence => "sequence",
            Self::Set => "set",
            Self::Vector => "vector",
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input feature configuration. Encoder and preprocessing sections are owned
/// by the feature implementation and passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFeatureConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    #[serde(default)]
    pub encoder: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub preprocessing: serde_json::Map<String, serde_json::Value>,
}

/// Output feature configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFeatureConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    /// Width of the tensor fed to the decoder. Filled in when the model is
    /// built; any value given in a config file is overwritten.
    #[serde(default)]
    pub input_size: Option<usize>,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub decoder: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub preprocessing: serde_json::Map<String, serde_json::Value>,
}

/// Loss settings of an output feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(rename = "type", default)]
    pub loss_type: Option<String>,
    /// Multiplier applied to this feature's loss when losses are summed.
    #[serde(default = "default_loss_weight")]
    pub weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: None,
            weight: default_loss_weight(),
        }
    }
}

fn default_loss_weight() -> f64 {
    1.0
}

/// Settings for autoregressive generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard upper bound on generated tokens per call.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub min_new_tokens: Option<usize>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            min_new_tokens: None,
            do_sample: false,
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            num_beams: default_num_beams(),
            repetition_penalty: default_repetition_penalty(),
            pad_token_id: None,
            eos_token_id: None,
        }
    }
}

fn default_max_new_tokens() -> usize {
    32
}

fn default_temperature() -> f64 {
    0.1
}

fn default_top_k() -> usize {
    50
}

fn default_top_p() -> f64 {
    1.0
}

fn default_num_beams() -> usize {
    1
}

fn default_repetition_penalty() -> f64 {
    1.0
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_new_tokens == 0 {
            return Err(ConfigError::invalid(
                "generation.max_new_tokens",
                "must be at least 1",
            ));
        }
        if let Some(min) = self.min_new_tokens
            && min > self.max_new_tokens
        {
            return Err(ConfigError::invalid(
                "generation.min_new_tokens",
                format!("{min} exceeds max_new_tokens {}", self.max_new_tokens),
            ));
        }
        if self.do_sample && self.temperature <= 0.0 {
            return Err(ConfigError::invalid(
                "generation.temperature",
                "must be positive when sampling",
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ConfigError::invalid(
                "generation.top_p",
                "must be in (0, 1]",
            ));
        }
        if self.num_beams == 0 {
            return Err(ConfigError::invalid(
                "generation.num_beams",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Adapter families, selected by the `type` key of the adapter section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    #[serde(alias = "PROMPT_TUNING")]
    PromptTuning(PromptTuningConfig),
    #[serde(alias = "LORA")]
    Lora(LoraConfig),
    #[serde(alias = "PREFIX_TUNING")]
    PrefixTuning(PrefixTuningConfig),
}

impl AdapterConfig {
    /// The `type` discriminator as written in config files.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PromptTuning(_) => "prompt_tuning",
            Self::Lora(_) => "lora",
            Self::PrefixTuning(_) => "prefix_tuning",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::PromptTuning(c) => c.validate(),
            Self::Lora(c) => c.validate(),
            Self::PrefixTuning(c) => c.validate(),
        }
    }
}

/// How prompt-tuning virtual tokens are initialised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PromptTuningInit {
    #[default]
    #[serde(alias = "random")]
    Random,
    #[serde(alias = "text")]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTuningConfig {
    #[serde(default = "default_num_virtual_tokens")]
    pub num_virtual_tokens: usize,
    #[serde(default)]
    pub prompt_tuning_init: PromptTuningInit,
    #[serde(default)]
    pub prompt_tuning_init_text: Option<String>,
    #[serde(default)]
    pub token_dim: Option<usize>,
    #[serde(default)]
    pub num_transformer_submodules: Option<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<usize>,
    #[serde(default)]
    pub num_layers: Option<usize>,
}

impl Default for PromptTuningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: default_num_virtual_tokens(),
            prompt_tuning_init: PromptTuningInit::Random,
            prompt_tuning_init_text: None,
            token_dim: None,
            num_transformer_submodules: None,
            num_attention_heads: None,
            num_layers: None,
        }
    }
}

impl PromptTuningConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_virtual_tokens == 0 {
            return Err(ConfigError::invalid(
                "adapter.num_virtual_tokens",
                "must be at least 1",
            ));
        }
        if self.prompt_tuning_init == PromptTuningInit::Text
            && self
                .prompt_tuning_init_text
                .as_deref()
                .is_none_or(|t| t.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "adapter.prompt_tuning_init_text",
                "required when prompt_tuning_init is TEXT",
            ));
        }
        Ok(())
    }
}

fn default_num_virtual_tokens() -> usize {
    8
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    #[default]
    None,
    All,
    LoraOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default = "default_lora_rank")]
    pub r: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f64,
    #[serde(default)]
    pub target_modules: Option<Vec<String>>,
    #[serde(default)]
    pub bias: LoraBias,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_lora_rank(),
            lora_alpha: default_lora_alpha(),
            lora_dropout: default_lora_dropout(),
            target_modules: None,
            bias: LoraBias::None,
        }
    }
}

impl LoraConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.r == 0 {
            return Err(ConfigError::invalid("adapter.r", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(ConfigError::invalid(
                "adapter.lora_dropout",
                "must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

fn default_lora_rank() -> usize {
    8
}

fn default_lora_alpha() -> f64 {
    16.0
}

fn default_lora_dropout() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixTuningConfig {
    #[serde(default = "default_num_virtual_tokens")]
    pub num_virtual_tokens: usize,
    #[serde(default)]
    pub encoder_hidden_size: Option<usize>,
    #[serde(default)]
    pub prefix_projection: bool,
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: default_num_virtual_tokens(),
            encoder_hidden_size: None,
            prefix_projection: false,
        }
    }
}

impl PrefixTuningConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_virtual_tokens == 0 {
            return Err(ConfigError::invalid(
                "adapter.num_virtual_tokens",
                "must be at least 1",
            ));
        }
        if self.prefix_projection && self.encoder_hidden_size.is_none() {
            return Err(ConfigError::invalid(
                "adapter.encoder_hidden_size",
                "required when prefix_projection is enabled",
            ));
        }
        Ok(())
    }
}

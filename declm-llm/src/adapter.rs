//! Parameter-efficient fine-tuning adapters.
//!
//! The declarative [`AdapterConfig`] is translated into a [`PeftConfig`]
//! (family selected by the uppercased `type`, tokenizer and base model bound
//! to the model id) and handed to an [`AdapterProvider`], which wraps the
//! frozen backbone in a trainable [`PeftModel`].

use std::path::{Path, PathBuf};

use declm_core::persistence;
use declm_core::schema::{AdapterConfig, PromptTuningConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backbone::CausalLm;
use crate::error::{LlmError, Result};

/// File holding the translated adapter config next to the adapter weights.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// PEFT family identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeftType {
    PromptTuning,
    Lora,
    PrefixTuning,
}

impl PeftType {
    /// Select a family from a config `type` discriminator, case-insensitively.
    pub fn from_discriminator(type_name: &str) -> Result<Self> {
        match type_name.to_ascii_uppercase().as_str() {
            "PROMPT_TUNING" => Ok(Self::PromptTuning),
            "LORA" => Ok(Self::Lora),
            "PREFIX_TUNING" => Ok(Self::PrefixTuning),
            other => Err(LlmError::adapter(format!("unknown adapter type '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptTuning => "PROMPT_TUNING",
            Self::Lora => "LORA",
            Self::PrefixTuning => "PREFIX_TUNING",
        }
    }
}

impl std::fmt::Display for PeftType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter config in the shape the adapter runtime consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftConfig {
    pub peft_type: PeftType,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    pub base_model_name_or_path: String,
    pub tokenizer_name_or_path: String,
    /// Frozen adapter weights when true. Forced to false on load so a restored
    /// model keeps training.
    #[serde(default)]
    pub inference_mode: bool,
    pub family: AdapterConfig,
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

impl PeftConfig {
    pub fn from_adapter(adapter: &AdapterConfig, model_name: &str) -> Result<Self> {
        Ok(Self {
            peft_type: PeftType::from_discriminator(adapter.type_name())?,
            task_type: default_task_type(),
            base_model_name_or_path: model_name.to_string(),
            tokenizer_name_or_path: model_name.to_string(),
            inference_mode: false,
            family: adapter.clone(),
        })
    }

    pub fn prompt_tuning(&self) -> Option<&PromptTuningConfig> {
        match &self.family {
            AdapterConfig::PromptTuning(c) => Some(c),
            _ => None,
        }
    }

    /// Read `adapter_config.json` from a saved adapter directory.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let config: Self = persistence::read_json(&dir.join(ADAPTER_CONFIG_FILE))?;
        let family_type = PeftType::from_discriminator(config.family.type_name())?;
        if family_type != config.peft_type {
            return Err(LlmError::adapter(format!(
                "saved adapter declares {} but carries a {} config",
                config.peft_type, family_type
            )));
        }
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        persistence::write_json_atomic(&path, self)?;
        Ok(path)
    }
}

/// Trainable vs. total parameter counts of an adapted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainableParameters {
    pub trainable: usize,
    pub total: usize,
}

impl TrainableParameters {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for TrainableParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.percent()
        )
    }
}

/// A backbone wrapped with an adapter. Behaves as a [`CausalLm`].
pub trait PeftModel: CausalLm {
    fn peft_config(&self) -> &PeftConfig;

    fn trainable_parameters(&self) -> TrainableParameters;

    /// Write the adapter weights (never the backbone) into `dir`, returning
    /// the files written.
    fn save_pretrained(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Builds and restores adapters around backbones.
pub trait AdapterProvider: Send + Sync {
    fn supports(&self, peft_type: PeftType) -> bool;

    /// Wrap `backbone` with freshly initialised adapter weights.
    fn wrap(&self, backbone: Box<dyn CausalLm>, config: &PeftConfig) -> Result<Box<dyn PeftModel>>;

    /// Wrap `backbone` with the adapter weights saved in `dir`.
    fn load(
        &self,
        backbone: Box<dyn CausalLm>,
        config: &PeftConfig,
        dir: &Path,
    ) -> Result<Box<dyn PeftModel>>;
}

/// Wrap `backbone` for fine-tuning and log its trainable parameters.
pub fn wrap_backbone(
    provider: &dyn AdapterProvider,
    backbone: Box<dyn CausalLm>,
    config: &PeftConfig,
) -> Result<Box<dyn PeftModel>> {
    if !provider.supports(config.peft_type) {
        return Err(LlmError::Unsupported(format!(
            "adapter family {} is not available",
            config.peft_type
        )));
    }
    let model = provider.wrap(backbone, config)?;
    info!(peft_type = %config.peft_type, "Trainable parameters for fine-tuning: {}", model.trainable_parameters());
    Ok(model)
}

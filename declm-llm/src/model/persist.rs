use std::path::Path;

use chrono::{DateTime, Utc};
use declm_core::persistence;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LlmModel, ModelState};
use crate::adapter::{PeftConfig, PeftType};
use crate::backbone::LoadOptions;
use crate::error::{LlmError, Result};

/// Subdirectory of a save path that holds the adapter weights.
pub const MODEL_WEIGHTS_DIR: &str = "model_weights";
/// Digest manifest written next to the adapter weights.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One saved weight file and its SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightFile {
    /// Path relative to the weights directory.
    pub name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Record of one adapter save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub id: String,
    pub base_model: String,
    pub peft_type: PeftType,
    pub files: Vec<WeightFile>,
    pub created_at: DateTime<Utc>,
}

impl AdapterManifest {
    /// Check every listed file against its recorded digest.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        for file in &self.files {
            let path = dir.join(&file.name);
            let found = persistence::sha256_file(&path)?;
            if found != file.sha256 {
                return Err(LlmError::Checksum {
                    path,
                    expected: file.sha256.clone(),
                    found,
                });
            }
        }
        Ok(())
    }
}

fn weight_file(dir: &Path, path: &Path) -> Result<WeightFile> {
    let name = path
        .strip_prefix(dir)
        .ok()
        .or_else(|| path.file_name().map(Path::new))
        .ok_or_else(|| LlmError::adapter(format!("unnamed weight file {}", path.display())))?;
    Ok(WeightFile {
        name: name.to_string_lossy().into_owned(),
        sha256: persistence::sha256_file(path)?,
        size_bytes: std::fs::metadata(path)?.len(),
    })
}

impl LlmModel {
    /// Write the adapter weights under `save_path/model_weights`.
    ///
    /// Only the adapter is saved, never the backbone. The manifest digests
    /// cover the weights and the adapter config. Without an adapter this does
    /// nothing.
    pub fn save(&self, save_path: &Path) -> Result<()> {
        let ModelState::FineTuning { model, peft_config } = &self.state else {
            debug!("No adapter attached; nothing to save");
            return Ok(());
        };

        let dir = save_path.join(MODEL_WEIGHTS_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut written = model.save_pretrained(&dir)?;
        written.push(peft_config.save(&dir)?);

        let files = written
            .iter()
            .map(|path| weight_file(&dir, path))
            .collect::<Result<Vec<_>>>()?;
        let manifest = AdapterManifest {
            id: uuid::Uuid::new_v4().to_string(),
            base_model: peft_config.base_model_name_or_path.clone(),
            peft_type: peft_config.peft_type,
            files,
            created_at: Utc::now(),
        };
        persistence::write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;

        info!(
            path = %dir.display(),
            id = %manifest.id,
            files = manifest.files.len(),
            "Saved adapter weights"
        );
        Ok(())
    }

    /// Restore adapter weights saved by [`LlmModel::save`].
    ///
    /// The backbone named in the saved adapter config is loaded fresh and the
    /// adapter is re-attached in training mode. Without an adapter this does
    /// nothing.
    pub fn load(&mut self, save_path: &Path) -> Result<()> {
        if !matches!(self.state, ModelState::FineTuning { .. }) {
            debug!("No adapter attached; nothing to load");
            return Ok(());
        }

        let dir = save_path.join(MODEL_WEIGHTS_DIR);
        let manifest: AdapterManifest = persistence::read_json(&dir.join(MANIFEST_FILE))?;
        manifest.verify(&dir)?;

        let mut peft_config = PeftConfig::from_pretrained(&dir)?;
        peft_config.inference_mode = false;

        let options = LoadOptions::from_settings(&self.context.backbone_settings)?;
        let backbone = self
            .context
            .backbones
            .load(&peft_config.base_model_name_or_path, &options)?;

        let vocab_size = backbone.config().vocab_size;
        let expected = self
            .output_features
            .first()
            .map(|(_, feature)| feature.input_size());
        if expected.is_some_and(|size| size != vocab_size) {
            return Err(LlmError::adapter(format!(
                "saved adapter targets '{}' with vocab size {vocab_size}, model was built for {expected:?}",
                peft_config.base_model_name_or_path
            )));
        }

        let model = self.context.adapters.load(backbone, &peft_config, &dir)?;
        info!(
            path = %dir.display(),
            id = %manifest.id,
            peft_type = %peft_config.peft_type,
            "Loaded adapter weights"
        );
        self.state = ModelState::FineTuning { model, peft_config };
        Ok(())
    }
}

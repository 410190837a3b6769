use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::{LlmModel, ModelState};
use crate::adapter::PeftModel;
use crate::backbone::CausalLm;
use crate::error::{LlmError, Result};
use crate::generation::truncate_to_suffix;
use crate::output::{FeatureInputs, FeatureTensors, ForwardInput, ForwardOutput, OutputKey};

impl LlmModel {
    /// Run one batch through the model.
    ///
    /// Input ids are cut to the most recent `max_input_length` positions and
    /// moved to the backbone device. With an adapter the per-token logits are
    /// averaged over the sequence and decoded; without one the backbone
    /// generates and the decoder builds predictions from sequences and scores.
    /// Targets in `input` are converted but not used. A batch with no token
    /// positions is rejected before it reaches the backbone.
    pub fn forward(
        &self,
        input: impl Into<ForwardInput>,
        attention_mask: Option<&Tensor>,
    ) -> Result<ForwardOutput> {
        let (inputs, _targets) = input.into().into_parts(&Device::Cpu)?;
        self.check_input_names(&inputs)?;

        let device = self.device();
        let input_ids = inputs
            .get(&self.input_name)
            .ok_or_else(|| LlmError::feature(&self.input_name, "missing from batch"))?
            .to_dtype(DType::U32)?;
        let input_ids = self.generation.truncate(&input_ids)?.to_device(device)?;
        if input_ids.dim(1)? == 0 {
            return Err(LlmError::shape("empty input sequence"));
        }
        debug!(shape = ?input_ids.dims(), device = ?device, "Prepared input ids");

        match &self.state {
            ModelState::FineTuning { model, .. } => self.fine_tuning_forward(model.as_ref(), &input_ids),
            ModelState::ZeroShotGeneration { model } => {
                self.generation_forward(model.as_ref(), &input_ids, attention_mask)
            }
        }
    }

    fn check_input_names(&self, inputs: &FeatureInputs) -> Result<()> {
        let mut expected = self.input_features.names();
        expected.sort();
        let actual: Vec<String> = inputs.keys().cloned().collect();
        if actual != expected {
            return Err(LlmError::InputMismatch { expected, actual });
        }
        Ok(())
    }

    fn fine_tuning_forward(&self, model: &dyn PeftModel, input_ids: &Tensor) -> Result<ForwardOutput> {
        let logits = model.forward(input_ids)?;
        if logits.rank() != 3 {
            return Err(LlmError::shape(format!(
                "expected [batch, seq, vocab] logits, got {:?}",
                logits.dims()
            )));
        }
        let averaged = logits.to_dtype(DType::F32)?.mean(1)?;
        let decoded = self.output_decoder.decode_logits(&averaged)?;
        Ok(ForwardOutput::Logits(BTreeMap::from([(
            OutputKey::logits(&self.output_name),
            decoded,
        )])))
    }

    fn generation_forward(
        &self,
        model: &dyn CausalLm,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<ForwardOutput> {
        let attention_mask = attention_mask
            .map(|mask| -> Result<Tensor> {
                Ok(truncate_to_suffix(mask, self.max_input_length())?.to_device(model.device())?)
            })
            .transpose()?;

        let generated = model
            .generate(input_ids, attention_mask.as_ref(), self.generation.config())?
            .detach();
        debug!(steps = generated.num_steps(), "Generated tokens");

        let decoded = self.output_decoder.decode_generated(&generated, input_ids)?;
        Ok(self.extract(decoded))
    }

    /// File the decoded prediction structure under the output feature's name.
    fn extract(&self, decoded: FeatureTensors) -> ForwardOutput {
        ForwardOutput::Generated(BTreeMap::from([(self.output_name.clone(), decoded)]))
    }
}

use std::cmp::Ordering;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::{LlmModel, ModelState};
use crate::error::{LlmError, Result};
use crate::output::{FeatureTensors, ForwardOutput, PREDICTIONS, Predictions, Targets};

/// Right-pad `target` with zeros along dim 1 up to `len` positions.
///
/// Targets already `len` or longer are returned unchanged; they are never
/// truncated.
pub fn pad_target_to(target: &Tensor, len: usize) -> Result<Tensor> {
    let target_len = target
        .dims()
        .get(1)
        .copied()
        .ok_or_else(|| LlmError::shape(format!("target has no sequence dim: {:?}", target.dims())))?;
    match len.cmp(&target_len) {
        Ordering::Greater => Ok(target.pad_with_zeros(1, 0, len - target_len)?),
        Ordering::Equal => Ok(target.clone()),
        Ordering::Less => {
            debug!(target_len, len, "Target longer than predictions; leaving it unpadded");
            Ok(target.clone())
        }
    }
}

/// Align a text target with the sequence length of its predictions.
pub fn realign_target(target: &Tensor, prediction: &FeatureTensors) -> Result<Tensor> {
    let predicted = prediction
        .get(PREDICTIONS)
        .ok_or_else(|| LlmError::shape("prediction structure has no 'predictions' tensor"))?;
    let predicted_len = predicted.dims().get(1).copied().ok_or_else(|| {
        LlmError::shape(format!(
            "predictions have no sequence dim: {:?}",
            predicted.dims()
        ))
    })?;
    pad_target_to(target, predicted_len)
}

fn target_for<'a>(targets: &'a Targets, feature: &str) -> Result<&'a Tensor> {
    targets
        .get(feature)
        .ok_or_else(|| LlmError::feature(feature, "no target in batch"))
}

fn prediction_for<'a>(predictions: &'a Predictions, feature: &str) -> Result<&'a FeatureTensors> {
    predictions
        .get(feature)
        .ok_or_else(|| LlmError::feature(feature, "no predictions in batch"))
}

fn to_cpu(tensors: &FeatureTensors) -> Result<FeatureTensors> {
    tensors
        .iter()
        .map(|(name, t)| Ok((name.clone(), t.to_device(&Device::Cpu)?)))
        .collect()
}

impl LlmModel {
    /// Turn forward outputs into per-feature prediction structures.
    pub fn outputs_to_predictions(&self, outputs: &ForwardOutput) -> Result<Predictions> {
        let mut predictions = Predictions::new();
        for (name, feature) in self.output_features.iter() {
            let prediction = match (&self.state, outputs) {
                (ModelState::FineTuning { .. }, ForwardOutput::Logits(map)) => {
                    feature.predictions(map, name)?
                }
                (ModelState::ZeroShotGeneration { .. }, ForwardOutput::Generated(map)) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LlmError::feature(name, "missing from generated outputs"))?,
                _ => {
                    return Err(LlmError::shape(format!(
                        "forward output does not match {:?} mode",
                        self.mode()
                    )));
                }
            };
            predictions.insert(name.to_string(), prediction);
        }
        Ok(predictions)
    }

    /// Feed a batch into every output feature's metrics and, when an adapter
    /// is attached, into the eval loss accumulators.
    ///
    /// Text targets are zero-padded to the prediction length first; the
    /// caller's targets are left untouched.
    pub fn update_metrics(&mut self, targets: &Targets, predictions: &Predictions) -> Result<()> {
        for (name, feature) in self.output_features.iter_mut() {
            let target = target_for(targets, name)?;
            let prediction = prediction_for(predictions, name)?;
            if feature.feature_type().is_text() {
                let aligned = realign_target(target, prediction)?;
                feature.update_metrics(&aligned, prediction)?;
            } else {
                feature.update_metrics(target, prediction)?;
            }
        }

        if matches!(self.state, ModelState::FineTuning { .. }) {
            let (eval_loss, additional_losses) = self.eval_loss(targets, predictions)?;
            self.eval_loss_metric.update(&eval_loss)?;
            self.eval_additional_losses_metric.update(&additional_losses)?;
        }
        Ok(())
    }

    /// Weighted sum of per-feature losses and the sum of the backbone's
    /// auxiliary losses, both as f32 scalars.
    ///
    /// Non-text features are evaluated on the CPU.
    pub fn eval_loss(&self, targets: &Targets, predictions: &Predictions) -> Result<(Tensor, Tensor)> {
        let mut eval_loss: Option<Tensor> = None;
        for (name, feature) in self.output_features.iter() {
            let target = target_for(targets, name)?;
            let prediction = prediction_for(predictions, name)?;
            let loss = if feature.feature_type().is_text() {
                let aligned = realign_target(target, prediction)?;
                feature.eval_loss(&aligned, prediction)?
            } else {
                let target = target.to_device(&Device::Cpu)?;
                feature.eval_loss(&target, &to_cpu(prediction)?)?
            };
            let weighted = loss
                .to_dtype(DType::F32)?
                .to_device(&Device::Cpu)?
                .affine(feature.loss_weight(), 0.0)?;
            eval_loss = Some(match eval_loss {
                Some(total) => total.add(&weighted)?,
                None => weighted,
            });
        }
        let eval_loss = match eval_loss {
            Some(loss) => loss,
            None => Tensor::zeros((), DType::F32, &Device::Cpu)?,
        };

        Ok((eval_loss, self.additional_losses()?))
    }

    fn additional_losses(&self) -> Result<Tensor> {
        let losses = self
            .state
            .backbone()
            .losses()?
            .iter()
            .map(|loss| Ok(loss.to_dtype(DType::F32)?.to_device(&Device::Cpu)?.sum_all()?))
            .collect::<Result<Vec<_>>>()?;
        if losses.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?);
        }
        Ok(Tensor::stack(&losses, 0)?.sum_all()?)
    }
}

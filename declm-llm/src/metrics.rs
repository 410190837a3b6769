//! Running-mean loss accumulators.

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Weighted running mean of scalar values, reset by the caller once per
/// evaluation epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeanMetric {
    sum: f64,
    weight: f64,
}

impl MeanMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_value(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weight += weight;
    }

    /// Add every element of `value` (usually a scalar loss) with weight 1 each.
    pub fn update(&mut self, value: &Tensor) -> Result<()> {
        let values = value.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        for v in values {
            self.update_value(v, 1.0);
        }
        Ok(())
    }

    /// The mean so far, or `None` before the first update.
    pub fn compute(&self) -> Option<f64> {
        if self.weight == 0.0 {
            tracing::warn!("Mean metric read before any update");
            None
        } else {
            Some(self.sum / self.weight)
        }
    }

    pub fn count(&self) -> f64 {
        self.weight
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

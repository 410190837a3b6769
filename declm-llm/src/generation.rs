//! Generation policy and input-length bookkeeping.

use candle_core::Tensor;
use declm_core::{ConfigError, GenerationConfig};

use crate::error::{LlmError, Result};

/// Tokens held back from the context window on top of `max_new_tokens`.
pub const CONTEXT_SAFETY_MARGIN: usize = 8;

/// Generation settings plus the input budget they leave in the context window.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPolicy {
    config: GenerationConfig,
    context_len: usize,
    max_input_length: usize,
}

impl GenerationPolicy {
    /// Derive `max_input_length = context_len - max_new_tokens - 8`.
    ///
    /// A context window with no room left for input is a configuration error.
    pub fn new(config: GenerationConfig, context_len: usize) -> Result<Self> {
        let max_input_length = config
            .max_new_tokens
            .checked_add(CONTEXT_SAFETY_MARGIN)
            .and_then(|reserved| context_len.checked_sub(reserved))
            .filter(|len| *len > 0)
            .ok_or(ConfigError::ContextTooSmall {
                context_len,
                max_new_tokens: config.max_new_tokens,
                margin: CONTEXT_SAFETY_MARGIN,
            })?;
        Ok(Self {
            config,
            context_len,
            max_input_length,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn context_len(&self) -> usize {
        self.context_len
    }

    pub fn max_new_tokens(&self) -> usize {
        self.config.max_new_tokens
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// Keep at most the last `max_input_length` positions of a `[batch, seq]`
    /// tensor.
    pub fn truncate(&self, tokens: &Tensor) -> Result<Tensor> {
        truncate_to_suffix(tokens, self.max_input_length)
    }
}

/// Keep the last `max_len` positions along dim 1; shorter tensors are returned as is.
pub fn truncate_to_suffix(tokens: &Tensor, max_len: usize) -> Result<Tensor> {
    let (_, seq_len) = tokens
        .dims2()
        .map_err(|_| LlmError::shape(format!("expected [batch, seq] tokens, got {:?}", tokens.dims())))?;
    if seq_len <= max_len {
        return Ok(tokens.clone());
    }
    tracing::debug!(seq_len, max_len, "Truncating input tokens to the most recent positions");
    Ok(tokens.narrow(1, seq_len - max_len, max_len)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn policy(max_new_tokens: usize, context_len: usize) -> Result<GenerationPolicy> {
        GenerationPolicy::new(
            GenerationConfig {
                max_new_tokens,
                ..GenerationConfig::default()
            },
            context_len,
        )
    }

    #[test]
    fn test_max_input_length() {
        let p = policy(10, 2048).unwrap();
        assert_eq!(p.max_input_length(), 2030);
        assert_eq!(p.context_len(), 2048);
        assert_eq!(p.max_new_tokens(), 10);
    }

    #[test]
    fn test_context_too_small() {
        assert!(matches!(
            policy(2040, 2048),
            Err(LlmError::Config(ConfigError::ContextTooSmall { .. }))
        ));
        assert!(policy(4000, 2048).is_err());
        assert_eq!(policy(2039, 2048).unwrap().max_input_length(), 1);
    }

    #[test]
    fn test_huge_max_new_tokens_is_context_error() {
        for max_new_tokens in [usize::MAX, usize::MAX - CONTEXT_SAFETY_MARGIN + 1] {
            assert!(matches!(
                policy(max_new_tokens, 2048),
                Err(LlmError::Config(ConfigError::ContextTooSmall { .. }))
            ));
        }
    }

    #[test]
    fn test_truncate_keeps_suffix() {
        let tokens = Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 9, 10]], &Device::Cpu).unwrap();
        let kept = truncate_to_suffix(&tokens, 3).unwrap();
        assert_eq!(
            kept.to_vec2::<u32>().unwrap(),
            vec![vec![3, 4, 5], vec![8, 9, 10]]
        );

        let untouched = truncate_to_suffix(&tokens, 5).unwrap();
        assert_eq!(untouched.dims(), &[2, 5]);
    }

    #[test]
    fn test_truncate_rejects_non_matrix() {
        let flat = Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap();
        assert!(matches!(
            truncate_to_suffix(&flat, 2),
            Err(LlmError::Shape(_))
        ));
    }
}

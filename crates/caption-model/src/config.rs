//! Model and decoding configuration.

use crate::error::CaptionError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub num_layers: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub feed_forward_dim: usize,
    pub grid_rows: usize,
    pub grid_cols: usize,
    /// Channel count of each feature-grid cell produced by the extractor.
    pub feature_dim: usize,
    pub vocab_size: usize,
    /// Length of the cached 1-D positional table for the decoder.
    pub max_position: usize,
    /// Rate the checkpoint was trained with. Inference never applies dropout.
    pub dropout_rate: f32,
}

impl Default for ModelConfig {
    /// Configuration of the published captioning checkpoint.
    fn default() -> Self {
        Self {
            num_layers: 2,
            d_model: 128,
            num_heads: 2,
            feed_forward_dim: 2048,
            grid_rows: 8,
            grid_cols: 8,
            feature_dim: 2048,
            vocab_size: 1733,
            max_position: 1733,
            dropout_rate: 0.1,
        }
    }
}

impl ModelConfig {
    /// Tiny test config for quick iteration
    pub fn tiny() -> Self {
        Self {
            num_layers: 2,
            d_model: 16,
            num_heads: 2,
            feed_forward_dim: 32,
            grid_rows: 2,
            grid_cols: 2,
            feature_dim: 8,
            vocab_size: 12,
            max_position: 128,
            dropout_rate: 0.0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// Number of positions in the flattened feature grid.
    pub fn grid_len(&self) -> usize {
        self.grid_rows * self.grid_cols
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.num_layers > 0, "num_layers must be positive"),
            (self.d_model > 0, "d_model must be positive"),
            (self.num_heads > 0, "num_heads must be positive"),
            (self.feed_forward_dim > 0, "feed_forward_dim must be positive"),
            (self.grid_len() > 0, "feature grid must be non-empty"),
            (self.feature_dim > 0, "feature_dim must be positive"),
            (self.vocab_size > 0, "vocab_size must be positive"),
            (self.max_position > 0, "max_position must be positive"),
        ];
        for (ok, message) in checks {
            if !ok {
                return Err(CaptionError::InvalidConfig(message.to_string()).into());
            }
        }
        if self.d_model % self.num_heads != 0 {
            return Err(CaptionError::InvalidConfig(format!(
                "d_model {} is not divisible by num_heads {}",
                self.d_model, self.num_heads
            ))
            .into());
        }
        if self.d_model % 2 != 0 {
            return Err(CaptionError::InvalidConfig(format!(
                "d_model {} must be even for the 2-D positional encoding",
                self.d_model
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub beam_width: usize,
    pub max_decode_steps: usize,
    /// Return per-layer attention weights of the final step with the caption.
    pub collect_attention: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            beam_width: 3,
            max_decode_steps: 100,
            collect_attention: false,
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.beam_width == 0 {
            return Err(CaptionError::InvalidConfig("beam_width must be positive".into()).into());
        }
        if self.max_decode_steps == 0 {
            return Err(
                CaptionError::InvalidConfig("max_decode_steps must be positive".into()).into(),
            );
        }
        if self.max_decode_steps > model.max_position {
            return Err(CaptionError::InvalidConfig(format!(
                "max_decode_steps {} exceeds the positional table length {}",
                self.max_decode_steps, model.max_position
            ))
            .into());
        }
        Ok(())
    }
}

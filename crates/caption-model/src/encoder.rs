//! Encoder stack over the flattened feature grid.

use crate::attention::multi_head_attention;
use crate::config::ModelConfig;
use crate::feed_forward::{add_and_norm, point_wise_feed_forward};
use crate::mask::broadcast_padding;
use crate::positional::positional_encoding_2d;
use crate::weights::{EncoderLayerWeights, ModelWeights};
use anyhow::{ensure, Result};
use captionforge_kernels::config::ActivationKind;
use captionforge_kernels::matmul::{dense, MatmulKernel};
use captionforge_kernels::utils::map_batch;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3};

pub struct Encoder {
    config: ModelConfig,
    /// (grid_rows * grid_cols, d_model)
    pos_encoding: Array2<f32>,
}

impl Encoder {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let pos_encoding =
            positional_encoding_2d(config.grid_rows, config.grid_cols, config.d_model)?;
        Ok(Self {
            config: config.clone(),
            pos_encoding,
        })
    }

    /// Runs the full stack.
    ///
    /// Inputs:
    /// - features: (batch, seq_len, feature_dim) with seq_len <= grid length
    /// - padding: optional per-position flags (1.0 = padded cell)
    ///
    /// Returns: (batch, seq_len, d_model)
    pub fn forward(
        &self,
        kernel: &dyn MatmulKernel,
        weights: &ModelWeights,
        features: ArrayView3<'_, f32>,
        padding: Option<&Array1<f32>>,
    ) -> Result<Array3<f32>> {
        let (_batch, seq_len, feature_dim) = features.dim();
        ensure!(
            feature_dim == self.config.feature_dim,
            "feature width {} differs from configured {}",
            feature_dim,
            self.config.feature_dim
        );
        ensure!(
            seq_len <= self.pos_encoding.nrows(),
            "sequence of {} cells exceeds the {}-cell grid",
            seq_len,
            self.pos_encoding.nrows()
        );

        let mask = match padding {
            Some(flags) => {
                ensure!(
                    flags.len() == seq_len,
                    "padding mask length {} differs from sequence length {}",
                    flags.len(),
                    seq_len
                );
                Some(broadcast_padding(flags, seq_len))
            }
            None => None,
        };

        let positions = self.pos_encoding.slice(s![..seq_len, ..]);
        let mut x = map_batch(features, |_, item| {
            let embedded = dense(
                kernel,
                item,
                weights.encoder_embedding.kernel.view(),
                Some(weights.encoder_embedding.bias.view()),
                ActivationKind::Relu,
            )?;
            Ok(embedded + &positions)
        })?;

        for layer in &weights.encoder_layers {
            x = encoder_layer(
                kernel,
                layer,
                self.config.num_heads,
                x.view(),
                mask.as_ref().map(|m| m.view()),
            )?;
        }
        Ok(x)
    }
}

/// Self-attention and feed-forward, each followed by residual + layer norm.
pub fn encoder_layer(
    kernel: &dyn MatmulKernel,
    weights: &EncoderLayerWeights,
    num_heads: usize,
    x: ArrayView3<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
) -> Result<Array3<f32>> {
    let attn = multi_head_attention(kernel, &weights.attention, num_heads, x, x, x, mask)?;
    let out1 = add_and_norm(x, attn.output.view(), &weights.layernorm1)?;

    let ffn = point_wise_feed_forward(kernel, &weights.ffn, out1.view())?;
    add_and_norm(out1.view(), ffn.view(), &weights.layernorm2)
}

//! Decoder stack over the partial caption.

use crate::attention::multi_head_attention;
use crate::config::ModelConfig;
use crate::feed_forward::{add_and_norm, point_wise_feed_forward};
use crate::mask::broadcast_padding;
use crate::positional::positional_encoding_1d;
use crate::weights::{DecoderLayerWeights, ModelWeights};
use anyhow::{ensure, Result};
use captionforge_kernels::matmul::MatmulKernel;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};

/// Attention weights of one decoder layer, `(batch, num_heads, seq_q, seq_k)`.
#[derive(Debug, Clone)]
pub struct LayerAttention {
    pub self_attention: Array4<f32>,
    pub cross_attention: Array4<f32>,
}

#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// (batch, seq_len, d_model)
    pub hidden: Array3<f32>,
    /// Indexed by layer; empty unless requested.
    pub attention: Vec<LayerAttention>,
}

pub struct Decoder {
    config: ModelConfig,
    /// (max_position, d_model)
    pos_encoding: Array2<f32>,
}

impl Decoder {
    pub fn new(config: &ModelConfig) -> Self {
        let pos_encoding = positional_encoding_1d(config.max_position, config.d_model);
        Self {
            config: config.clone(),
            pos_encoding,
        }
    }

    /// Forward pass over token ids.
    ///
    /// Inputs:
    /// - tokens: (batch, seq_len) ids
    /// - enc_output: (batch, grid_len, d_model)
    /// - look_ahead_mask: (seq_len, seq_len) for self-attention
    /// - enc_padding: per-cell flags of the encoder output for cross-attention
    pub fn forward(
        &self,
        kernel: &dyn MatmulKernel,
        weights: &ModelWeights,
        tokens: ArrayView2<'_, usize>,
        enc_output: ArrayView3<'_, f32>,
        look_ahead_mask: Option<ArrayView2<'_, f32>>,
        enc_padding: Option<&Array1<f32>>,
        collect_attention: bool,
    ) -> Result<DecoderOutput> {
        let (batch, seq_len) = tokens.dim();
        ensure!(seq_len > 0, "decoder needs at least one token");
        ensure!(
            batch == enc_output.len_of(Axis(0)),
            "token batch {} differs from encoder batch {}",
            batch,
            enc_output.len_of(Axis(0))
        );
        ensure!(
            seq_len <= self.pos_encoding.nrows(),
            "sequence length {} exceeds max_position {}",
            seq_len,
            self.pos_encoding.nrows()
        );

        let cross_mask = match enc_padding {
            Some(flags) => {
                ensure!(
                    flags.len() == enc_output.len_of(Axis(1)),
                    "encoder padding length {} differs from encoder length {}",
                    flags.len(),
                    enc_output.len_of(Axis(1))
                );
                Some(broadcast_padding(flags, seq_len))
            }
            None => None,
        };

        let mut x = self.embed(weights, tokens)?;

        let mut attention = Vec::new();
        for layer in &weights.decoder_layers {
            let (out, layer_attention) = decoder_layer(
                kernel,
                layer,
                self.config.num_heads,
                x.view(),
                enc_output,
                look_ahead_mask,
                cross_mask.as_ref().map(|m| m.view()),
            )?;
            x = out;
            if collect_attention {
                attention.push(layer_attention);
            }
        }

        Ok(DecoderOutput {
            hidden: x,
            attention,
        })
    }

    /// Token embedding scaled by `sqrt(d_model)`, plus positional encoding.
    fn embed(&self, weights: &ModelWeights, tokens: ArrayView2<'_, usize>) -> Result<Array3<f32>> {
        let (batch, seq_len) = tokens.dim();
        let d_model = self.config.d_model;
        let scale = (d_model as f32).sqrt();
        let vocab_size = weights.decoder_embedding.nrows();

        let mut hidden = Array3::<f32>::zeros((batch, seq_len, d_model));
        for ((b, i), &token_id) in tokens.indexed_iter() {
            ensure!(
                token_id < vocab_size,
                "token id {} outside vocabulary of {}",
                token_id,
                vocab_size
            );
            let row = &weights.decoder_embedding.row(token_id) * scale
                + &self.pos_encoding.row(i);
            hidden.slice_mut(s![b, i, ..]).assign(&row);
        }
        Ok(hidden)
    }
}

/// Masked self-attention, cross-attention to the encoder output, then
/// feed-forward; each followed by residual + layer norm.
pub fn decoder_layer(
    kernel: &dyn MatmulKernel,
    weights: &DecoderLayerWeights,
    num_heads: usize,
    x: ArrayView3<'_, f32>,
    enc_output: ArrayView3<'_, f32>,
    look_ahead_mask: Option<ArrayView2<'_, f32>>,
    padding_mask: Option<ArrayView2<'_, f32>>,
) -> Result<(Array3<f32>, LayerAttention)> {
    let attn1 = multi_head_attention(
        kernel,
        &weights.self_attention,
        num_heads,
        x,
        x,
        x,
        look_ahead_mask,
    )?;
    let out1 = add_and_norm(x, attn1.output.view(), &weights.layernorm1)?;

    let attn2 = multi_head_attention(
        kernel,
        &weights.cross_attention,
        num_heads,
        out1.view(),
        enc_output,
        enc_output,
        padding_mask,
    )?;
    let out2 = add_and_norm(out1.view(), attn2.output.view(), &weights.layernorm2)?;

    let ffn = point_wise_feed_forward(kernel, &weights.ffn, out2.view())?;
    let out3 = add_and_norm(out2.view(), ffn.view(), &weights.layernorm3)?;

    Ok((
        out3,
        LayerAttention {
            self_attention: attn1.weights,
            cross_attention: attn2.weights,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::combined_mask;
    use approx::assert_abs_diff_eq;
    use captionforge_kernels::matmul::ReferenceMatmul;

    fn encoder_output(config: &ModelConfig) -> Array3<f32> {
        Array3::from_shape_fn((1, config.grid_len(), config.d_model), |(_, i, j)| {
            ((i * 5 + j) % 7) as f32 * 0.2 - 0.6
        })
    }

    fn run(
        config: &ModelConfig,
        weights: &ModelWeights,
        tokens: &[usize],
        collect: bool,
    ) -> DecoderOutput {
        let decoder = Decoder::new(config);
        let ids = Array2::from_shape_vec((1, tokens.len()), tokens.to_vec()).expect("tokens");
        let mask = combined_mask(tokens);
        decoder
            .forward(
                &ReferenceMatmul::new(),
                weights,
                ids.view(),
                encoder_output(config).view(),
                Some(mask.view()),
                None,
                collect,
            )
            .expect("decoder forward")
    }

    #[test]
    fn hidden_state_per_position() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 4).expect("weights");
        let out = run(&config, &weights, &[2, 5, 7], false);
        assert_eq!(out.hidden.dim(), (1, 3, config.d_model));
        assert!(out.attention.is_empty());
    }

    #[test]
    fn attention_collected_per_layer() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 4).expect("weights");
        let out = run(&config, &weights, &[2, 5, 7], true);
        assert_eq!(out.attention.len(), config.num_layers);
        for layer in &out.attention {
            assert_eq!(layer.self_attention.dim(), (1, config.num_heads, 3, 3));
            assert_eq!(
                layer.cross_attention.dim(),
                (1, config.num_heads, 3, config.grid_len())
            );
        }
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 4).expect("weights");
        let short = run(&config, &weights, &[2, 5], false);
        let long = run(&config, &weights, &[2, 5, 9], false);
        for i in 0..2 {
            for j in 0..config.d_model {
                assert_abs_diff_eq!(
                    short.hidden[(0, i, j)],
                    long.hidden[(0, i, j)],
                    epsilon = 1e-5
                );
            }
        }
    }

    #[test]
    fn out_of_vocabulary_token_is_rejected() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 4).expect("weights");
        let decoder = Decoder::new(&config);
        let ids = Array2::from_elem((1, 1), config.vocab_size);
        let result = decoder.forward(
            &ReferenceMatmul::new(),
            &weights,
            ids.view(),
            encoder_output(&config).view(),
            None,
            None,
            false,
        );
        assert!(result.is_err());
    }
}

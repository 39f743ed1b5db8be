//! Encoder + decoder + vocabulary projection.

use crate::config::ModelConfig;
use crate::decoder::{Decoder, LayerAttention};
use crate::encoder::Encoder;
use crate::mask::combined_mask;
use crate::weights::ModelWeights;
use anyhow::{Context, Result};
use captionforge_kernels::config::{ActivationKind, KernelChoice};
use captionforge_kernels::matmul::{dense, DynMatmulKernel};
use captionforge_kernels::utils::map_batch;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TransformerOutput {
    /// (batch, seq_len, vocab_size)
    pub logits: Array3<f32>,
    pub attention: Vec<LayerAttention>,
}

/// Logits for the token following a partial sequence.
#[derive(Debug, Clone)]
pub struct StepLogits {
    /// (vocab_size)
    pub logits: Array1<f32>,
    pub attention: Vec<LayerAttention>,
}

pub struct Transformer {
    config: ModelConfig,
    weights: Arc<ModelWeights>,
    encoder: Encoder,
    decoder: Decoder,
    kernel: DynMatmulKernel,
}

impl Transformer {
    pub fn new(config: ModelConfig, weights: Arc<ModelWeights>, kernel: KernelChoice) -> Result<Self> {
        config.validate()?;
        weights.validate(&config)?;
        let encoder = Encoder::new(&config)?;
        let decoder = Decoder::new(&config);

        Ok(Self {
            config,
            weights,
            encoder,
            decoder,
            kernel: kernel.kernel(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Encoder pass. Depends only on the features, so one result serves
    /// every decode step of a request.
    pub fn encode(
        &self,
        features: ArrayView3<'_, f32>,
        padding: Option<&Array1<f32>>,
    ) -> Result<Array3<f32>> {
        self.encoder
            .forward(self.kernel.as_ref(), &self.weights, features, padding)
            .context("encoder pass failed")
    }

    /// Decoder pass plus the final projection to vocabulary logits.
    pub fn decode(
        &self,
        tokens: ArrayView2<'_, usize>,
        enc_output: ArrayView3<'_, f32>,
        look_ahead_mask: Option<ArrayView2<'_, f32>>,
        enc_padding: Option<&Array1<f32>>,
        collect_attention: bool,
    ) -> Result<TransformerOutput> {
        let decoded = self
            .decoder
            .forward(
                self.kernel.as_ref(),
                &self.weights,
                tokens,
                enc_output,
                look_ahead_mask,
                enc_padding,
                collect_attention,
            )
            .context("decoder pass failed")?;

        let final_layer = &self.weights.final_layer;
        let logits = map_batch(decoded.hidden.view(), |_, item| {
            dense(
                self.kernel.as_ref(),
                item,
                final_layer.kernel.view(),
                Some(final_layer.bias.view()),
                ActivationKind::None,
            )
        })?;

        Ok(TransformerOutput {
            logits,
            attention: decoded.attention,
        })
    }

    /// Full composition: encode `features`, then decode `tokens` against it.
    pub fn forward(
        &self,
        features: ArrayView3<'_, f32>,
        tokens: ArrayView2<'_, usize>,
        look_ahead_mask: Option<ArrayView2<'_, f32>>,
        enc_padding: Option<&Array1<f32>>,
        collect_attention: bool,
    ) -> Result<TransformerOutput> {
        let enc_output = self.encode(features, enc_padding)?;
        self.decode(
            tokens,
            enc_output.view(),
            look_ahead_mask,
            enc_padding,
            collect_attention,
        )
    }

    /// Runs the decoder on one partial sequence under the combined causal +
    /// padding mask and returns the logits of its last position.
    pub fn next_token_logits(
        &self,
        enc_output: ArrayView3<'_, f32>,
        tokens: &[usize],
        collect_attention: bool,
    ) -> Result<StepLogits> {
        let ids = Array2::from_shape_vec((1, tokens.len()), tokens.to_vec())?;
        let mask = combined_mask(tokens);
        let output = self.decode(
            ids.view(),
            enc_output,
            Some(mask.view()),
            None,
            collect_attention,
        )?;

        let last = tokens.len() - 1;
        let logits = output
            .logits
            .index_axis(Axis(0), 0)
            .row(last)
            .to_owned();
        Ok(StepLogits {
            logits,
            attention: output.attention,
        })
    }
}

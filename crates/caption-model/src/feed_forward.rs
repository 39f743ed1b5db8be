//! Position-wise sublayers shared by encoder and decoder layers.

use crate::weights::{FeedForwardWeights, LayerNormWeights};
use anyhow::{ensure, Result};
use captionforge_kernels::config::ActivationKind;
use captionforge_kernels::layernorm::layer_norm;
use captionforge_kernels::matmul::{dense, MatmulKernel};
use captionforge_kernels::utils::map_batch;
use ndarray::{Array3, ArrayView3};

pub const LAYER_NORM_EPSILON: f32 = 1e-6;

/// `dense(relu(dense(x)))`, applied to every position independently.
pub fn point_wise_feed_forward(
    kernel: &dyn MatmulKernel,
    weights: &FeedForwardWeights,
    x: ArrayView3<'_, f32>,
) -> Result<Array3<f32>> {
    map_batch(x, |_, item| {
        let hidden = dense(
            kernel,
            item,
            weights.hidden.kernel.view(),
            Some(weights.hidden.bias.view()),
            ActivationKind::Relu,
        )?;
        dense(
            kernel,
            hidden.view(),
            weights.output.kernel.view(),
            Some(weights.output.bias.view()),
            ActivationKind::None,
        )
    })
}

/// Residual connection followed by layer normalization: `norm(x + sublayer)`.
pub fn add_and_norm(
    x: ArrayView3<'_, f32>,
    sublayer: ArrayView3<'_, f32>,
    weights: &LayerNormWeights,
) -> Result<Array3<f32>> {
    ensure!(
        x.dim() == sublayer.dim(),
        "residual shape {:?} differs from sublayer output {:?}",
        x.dim(),
        sublayer.dim()
    );
    let sum = &x + &sublayer;
    map_batch(sum.view(), |_, item| {
        layer_norm(
            item,
            weights.gamma.view(),
            weights.beta.view(),
            LAYER_NORM_EPSILON,
        )
    })
}

//! Multi-head attention over explicit weights.
//!
//! The same function serves encoder self-attention, decoder masked
//! self-attention and decoder cross-attention; callers differ only in the
//! mask and in which tensors act as query versus key/value.

use crate::weights::{AttentionWeights, DenseWeights};
use anyhow::{ensure, Result};
use captionforge_kernels::attention::scaled_dot_product_attention;
use captionforge_kernels::config::ActivationKind;
use captionforge_kernels::matmul::{dense, MatmulKernel};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};

#[derive(Debug, Clone)]
pub struct AttentionResult {
    /// (batch, seq_q, d_model)
    pub output: Array3<f32>,
    /// (batch, num_heads, seq_q, seq_k)
    pub weights: Array4<f32>,
}

/// Project, split into `num_heads` heads of width `d_model / num_heads`,
/// attend per head, concatenate and project back to `d_model`.
///
/// `mask` is `(seq_q, seq_k)` with 1.0 on blocked positions and is shared by
/// every batch item and head.
pub fn multi_head_attention(
    kernel: &dyn MatmulKernel,
    weights: &AttentionWeights,
    num_heads: usize,
    query: ArrayView3<'_, f32>,
    key: ArrayView3<'_, f32>,
    value: ArrayView3<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
) -> Result<AttentionResult> {
    let (batch, seq_q, d_model) = query.dim();
    let (key_batch, seq_k, key_dim) = key.dim();
    ensure!(num_heads > 0, "num_heads must be positive");
    ensure!(
        d_model % num_heads == 0,
        "d_model {} is not divisible by num_heads {}",
        d_model,
        num_heads
    );
    ensure!(
        batch == key_batch && key.dim() == value.dim(),
        "query {:?}, key {:?} and value {:?} batches disagree",
        query.dim(),
        key.dim(),
        value.dim()
    );
    ensure!(
        key_dim == d_model,
        "key width {} differs from query width {}",
        key_dim,
        d_model
    );

    let depth = d_model / num_heads;
    let scale = 1.0 / (depth as f32).sqrt();
    let mut output = Array3::<f32>::zeros((batch, seq_q, d_model));
    let mut attention = Array4::<f32>::zeros((batch, num_heads, seq_q, seq_k));

    for b in 0..batch {
        let q = project(kernel, &weights.wq, query.index_axis(Axis(0), b))?;
        let k = project(kernel, &weights.wk, key.index_axis(Axis(0), b))?;
        let v = project(kernel, &weights.wv, value.index_axis(Axis(0), b))?;

        let mut concat = Array2::<f32>::zeros((seq_q, d_model));
        for h in 0..num_heads {
            let cols = h * depth..(h + 1) * depth;
            let head = scaled_dot_product_attention(
                q.slice(s![.., cols.clone()]),
                k.slice(s![.., cols.clone()]),
                v.slice(s![.., cols.clone()]),
                mask,
                scale,
            )?;
            concat.slice_mut(s![.., cols]).assign(&head.output);
            attention.slice_mut(s![b, h, .., ..]).assign(&head.weights);
        }

        let projected = project(kernel, &weights.dense, concat.view())?;
        output.index_axis_mut(Axis(0), b).assign(&projected);
    }

    Ok(AttentionResult {
        output,
        weights: attention,
    })
}

fn project(
    kernel: &dyn MatmulKernel,
    weights: &DenseWeights,
    input: ArrayView2<'_, f32>,
) -> Result<Array2<f32>> {
    dense(
        kernel,
        input,
        weights.kernel.view(),
        Some(weights.bias.view()),
        ActivationKind::None,
    )
}

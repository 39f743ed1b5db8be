//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Added to a masked score before softmax; drives its weight to ~0.
pub const MASK_FILL: f32 = -1e9;

#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// (seq_q, d_v)
    pub output: Array2<f32>,
    /// (seq_q, seq_k), rows sum to one
    pub weights: Array2<f32>,
}

/// `softmax(q·kᵗ·scale + mask·MASK_FILL)·v`.
///
/// `mask` holds 1.0 where a key position must be ignored and 0.0 elsewhere.
pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<AttentionOutput> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    if let Some(mask) = mask {
        ensure!(
            mask.dim() == scores.dim(),
            "mask shape {:?} incompatible with attention scores {:?}",
            mask.dim(),
            scores.dim()
        );
        scores.scaled_add(MASK_FILL, &mask);
    }

    softmax_inplace(scores.view_mut());
    ensure!(
        scores.ncols() == value.nrows(),
        "scores column count {} differs from value rows {}",
        scores.ncols(),
        value.nrows()
    );
    let output = scores.dot(&value);
    Ok(AttentionOutput {
        output,
        weights: scores,
    })
}

//! Shared helpers for kernel implementations.

use crate::config::ActivationKind;
use anyhow::{bail, ensure, Result};
use ndarray::{stack, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// Adds a per-column bias to every row, then applies the activation.
pub fn apply_bias_activation(
    mut output: Array2<f32>,
    bias: Option<&ArrayView1<'_, f32>>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    if let Some(bias) = bias {
        if bias.len() != output.ncols() {
            bail!(
                "bias length {} incompatible with output {:?}",
                bias.len(),
                output.shape()
            );
        }
        output += bias;
    }

    match activation {
        ActivationKind::None => Ok(output),
        ActivationKind::Relu => {
            output.mapv_inplace(|x| x.max(0.0));
            Ok(output)
        }
    }
}

/// Row-wise softmax. Each row is reduced by a single thread.
pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            row -= max;
            row.mapv_inplace(|x| x.exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Applies `f` to every item of a `(batch, rows, cols)` tensor and restacks
/// the results along the batch axis.
pub fn map_batch<F>(input: ArrayView3<'_, f32>, mut f: F) -> Result<Array3<f32>>
where
    F: FnMut(usize, ArrayView2<'_, f32>) -> Result<Array2<f32>>,
{
    ensure!(input.len_of(Axis(0)) > 0, "batch dimension must be non-empty");
    let outputs = input
        .outer_iter()
        .enumerate()
        .map(|(idx, item)| f(idx, item))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<ArrayView2<'_, f32>> = outputs.iter().map(|o| o.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array3};

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut scores = Array2::from_shape_fn((5, 7), |(i, j)| (i as f32 - j as f32) * 0.7);
        softmax_inplace(scores.view_mut());
        for row in scores.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn softmax_of_equal_logits_is_uniform() {
        let mut scores = Array2::<f32>::zeros((1, 4));
        softmax_inplace(scores.view_mut());
        for p in scores.iter() {
            assert_abs_diff_eq!(*p, 0.25, epsilon = 1e-7);
        }
    }

    #[test]
    fn bias_broadcasts_over_rows_then_relu() {
        let output = array![[1.0f32, -2.0], [0.5, 0.5]];
        let bias = Array1::from(vec![-2.0f32, 1.0]);
        let result =
            apply_bias_activation(output, Some(&bias.view()), ActivationKind::Relu).expect("bias");
        assert_eq!(result, array![[0.0f32, 0.0], [0.0, 1.5]]);
    }

    #[test]
    fn map_batch_applies_per_item() {
        let input = Array3::from_shape_fn((3, 2, 2), |(b, i, j)| (b * 4 + i * 2 + j) as f32);
        let output = map_batch(input.view(), |b, item| Ok(item.to_owned() * (b + 1) as f32))
            .expect("map batch");
        assert_eq!(output.dim(), (3, 2, 2));
        assert_eq!(output[(2, 1, 1)], 11.0 * 3.0);
    }

    #[test]
    fn map_batch_rejects_empty_batch() {
        let input = Array3::<f32>::zeros((0, 2, 2));
        assert!(map_batch(input.view(), |_, item| Ok(item.to_owned())).is_err());
    }

    #[test]
    fn bias_length_mismatch_is_rejected() {
        let output = Array2::<f32>::zeros((2, 3));
        let bias = Array1::<f32>::zeros(2);
        assert!(apply_bias_activation(output, Some(&bias.view()), ActivationKind::None).is_err());
    }
}

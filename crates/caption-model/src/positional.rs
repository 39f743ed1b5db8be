//! Sinusoidal positional encodings.
//!
//! Both tables depend only on the model configuration. The encoder and
//! decoder build theirs once at construction and slice rows per call.

use anyhow::{ensure, Result};
use ndarray::{concatenate, Array2, Axis};

/// `pos / 10000^(2⌊i/2⌋ / d_model)`, evaluated in f64.
fn angle(pos: usize, i: usize, d_model: usize) -> f64 {
    let exponent = (2 * (i / 2)) as f64 / d_model as f64;
    pos as f64 / 10000f64.powf(exponent)
}

/// Sine on even channels, cosine on odd channels.
fn encode(pos: usize, i: usize, d_model: usize) -> f32 {
    let a = angle(pos, i, d_model);
    if i % 2 == 0 {
        a.sin() as f32
    } else {
        a.cos() as f32
    }
}

/// Table of shape `(positions, d_model)` for sequence positions `0..positions`.
pub fn positional_encoding_1d(positions: usize, d_model: usize) -> Array2<f32> {
    Array2::from_shape_fn((positions, d_model), |(pos, i)| encode(pos, i, d_model))
}

/// Table of shape `(rows * cols, d_model)` for a row-major grid.
///
/// The first `d_model / 2` channels encode the row index and the last
/// `d_model / 2` the column index, each with `d_model / 2` as its width.
pub fn positional_encoding_2d(rows: usize, cols: usize, d_model: usize) -> Result<Array2<f32>> {
    ensure!(
        d_model % 2 == 0,
        "2-D positional encoding needs an even d_model, got {}",
        d_model
    );
    let half = d_model / 2;
    let cells = rows * cols;

    let row_part = Array2::from_shape_fn((cells, half), |(cell, i)| encode(cell / cols, i, half));
    let col_part = Array2::from_shape_fn((cells, half), |(cell, i)| encode(cell % cols, i, half));

    Ok(concatenate(Axis(1), &[row_part.view(), col_part.view()])?)
}

//! Attention masks. A value of 1.0 marks a position that must not be attended.

use ndarray::{Array1, Array2};

/// Reserved id carried by padding positions.
pub const PAD_ID: usize = 0;

/// `(n, n)` matrix with ones strictly above the diagonal: query `i` cannot
/// see key `j > i`.
pub fn look_ahead_mask(n: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, n), |(i, j)| if j > i { 1.0 } else { 0.0 })
}

/// One flag per position, set where the token is the padding id.
pub fn padding_mask(tokens: &[usize]) -> Array1<f32> {
    tokens
        .iter()
        .map(|&id| if id == PAD_ID { 1.0 } else { 0.0 })
        .collect()
}

/// Decoder self-attention mask: elementwise maximum of the look-ahead mask
/// and the key-padding mask broadcast over query rows.
pub fn combined_mask(tokens: &[usize]) -> Array2<f32> {
    let mut mask = look_ahead_mask(tokens.len());
    let padding = padding_mask(tokens);
    for mut row in mask.rows_mut() {
        row.zip_mut_with(&padding, |m, &p| *m = m.max(p));
    }
    mask
}

/// Key-padding mask broadcast to `(query_len, key_len)`.
pub fn broadcast_padding(padding: &Array1<f32>, query_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((query_len, padding.len()), |(_, j)| padding[j])
}

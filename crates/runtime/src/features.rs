//! Feature-grid artifacts produced by the external image encoder.
//!
//! A safetensors file holding one F32 tensor named `features`. Its shape is
//! checked by the engine, not here.

use anyhow::{ensure, Context, Result};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const FEATURES_TENSOR: &str = "features";

pub fn features_from_bytes(data: &[u8]) -> Result<ArrayD<f32>> {
    let tensors = SafeTensors::deserialize(data).context("failed to parse feature artifact")?;
    let view = tensors
        .tensor(FEATURES_TENSOR)
        .with_context(|| format!("feature artifact has no '{}' tensor", FEATURES_TENSOR))?;
    ensure!(
        view.dtype() == Dtype::F32,
        "feature tensor has dtype {:?}, expected F32",
        view.dtype()
    );

    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    ArrayD::from_shape_vec(IxDyn(view.shape()), values).context("failed to reshape features")
}

pub fn load_features(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    let data = fs::read(path)
        .with_context(|| format!("failed to read feature file {}", path.display()))?;
    let features = features_from_bytes(&data)?;
    debug!(path = %path.display(), shape = ?features.shape(), "loaded feature grid");
    Ok(features)
}

pub fn features_to_bytes(features: ArrayViewD<'_, f32>) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = features.iter().flat_map(|v| v.to_le_bytes()).collect();
    let view = TensorView::new(Dtype::F32, features.shape().to_vec(), &bytes)
        .context("failed to build feature tensor view")?;
    safetensors::serialize([(FEATURES_TENSOR, view)], &None)
        .context("failed to serialize features")
}

pub fn save_features(path: impl AsRef<Path>, features: ArrayViewD<'_, f32>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, features_to_bytes(features)?)
        .with_context(|| format!("failed to write feature file {}", path.display()))
}

//! Weight structures and the safetensors loader.
//!
//! Tensor naming follows the layer tree of the captioning model, e.g.
//! `decoder.layers.1.mha2.wq.kernel` or `encoder.layers.0.layernorm1.gamma`.
//! Dense kernels are stored `(in_features, out_features)`.

use crate::config::ModelConfig;
use crate::error::CaptionError;
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2, ArrayViewD};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

const LAYER_COUNT_KEY: &str = "num_layers";

#[derive(Debug, Clone)]
pub struct DenseWeights {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub wq: DenseWeights,
    pub wk: DenseWeights,
    pub wv: DenseWeights,
    /// Output projection applied to the concatenated heads.
    pub dense: DenseWeights,
}

#[derive(Debug, Clone)]
pub struct FeedForwardWeights {
    /// `d_model -> feed_forward_dim`, ReLU.
    pub hidden: DenseWeights,
    /// `feed_forward_dim -> d_model`.
    pub output: DenseWeights,
}

#[derive(Debug, Clone)]
pub struct EncoderLayerWeights {
    pub attention: AttentionWeights,
    pub ffn: FeedForwardWeights,
    pub layernorm1: LayerNormWeights,
    pub layernorm2: LayerNormWeights,
}

#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub self_attention: AttentionWeights,
    pub cross_attention: AttentionWeights,
    pub ffn: FeedForwardWeights,
    pub layernorm1: LayerNormWeights,
    pub layernorm2: LayerNormWeights,
    pub layernorm3: LayerNormWeights,
}

/// Every parameter of the model. Built once, then shared read-only.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// Projects each `feature_dim` grid cell to `d_model` (ReLU).
    pub encoder_embedding: DenseWeights,
    pub encoder_layers: Vec<EncoderLayerWeights>,
    /// `(vocab_size, d_model)` token embedding table.
    pub decoder_embedding: Array2<f32>,
    pub decoder_layers: Vec<DecoderLayerWeights>,
    /// `d_model -> vocab_size` logits projection.
    pub final_layer: DenseWeights,
}

/// Produces named parameter tensors of a requested shape.
trait TensorSource {
    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>>;
    fn vector(&mut self, name: &str, len: usize, fill: VectorFill) -> Result<Array1<f32>>;
}

/// Initial value of a vector when it is synthesized instead of loaded.
#[derive(Clone, Copy)]
enum VectorFill {
    Zeros,
    Ones,
}

fn dense(
    source: &mut dyn TensorSource,
    name: &str,
    in_features: usize,
    out_features: usize,
) -> Result<DenseWeights> {
    Ok(DenseWeights {
        kernel: source.matrix(&format!("{}.kernel", name), in_features, out_features)?,
        bias: source.vector(&format!("{}.bias", name), out_features, VectorFill::Zeros)?,
    })
}

fn layer_norm(source: &mut dyn TensorSource, name: &str, dim: usize) -> Result<LayerNormWeights> {
    Ok(LayerNormWeights {
        gamma: source.vector(&format!("{}.gamma", name), dim, VectorFill::Ones)?,
        beta: source.vector(&format!("{}.beta", name), dim, VectorFill::Zeros)?,
    })
}

fn attention(source: &mut dyn TensorSource, name: &str, d_model: usize) -> Result<AttentionWeights> {
    Ok(AttentionWeights {
        wq: dense(source, &format!("{}.wq", name), d_model, d_model)?,
        wk: dense(source, &format!("{}.wk", name), d_model, d_model)?,
        wv: dense(source, &format!("{}.wv", name), d_model, d_model)?,
        dense: dense(source, &format!("{}.dense", name), d_model, d_model)?,
    })
}

fn feed_forward(
    source: &mut dyn TensorSource,
    name: &str,
    config: &ModelConfig,
) -> Result<FeedForwardWeights> {
    Ok(FeedForwardWeights {
        hidden: dense(
            source,
            &format!("{}.0", name),
            config.d_model,
            config.feed_forward_dim,
        )?,
        output: dense(
            source,
            &format!("{}.1", name),
            config.feed_forward_dim,
            config.d_model,
        )?,
    })
}

impl ModelWeights {
    fn build(config: &ModelConfig, source: &mut dyn TensorSource) -> Result<Self> {
        let d = config.d_model;

        let encoder_embedding = dense(source, "encoder.embedding", config.feature_dim, d)?;
        let mut encoder_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let prefix = format!("encoder.layers.{}", i);
            encoder_layers.push(EncoderLayerWeights {
                attention: attention(source, &format!("{}.mha", prefix), d)?,
                ffn: feed_forward(source, &format!("{}.ffn", prefix), config)?,
                layernorm1: layer_norm(source, &format!("{}.layernorm1", prefix), d)?,
                layernorm2: layer_norm(source, &format!("{}.layernorm2", prefix), d)?,
            });
        }

        let decoder_embedding = source.matrix("decoder.embedding", config.vocab_size, d)?;
        let mut decoder_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let prefix = format!("decoder.layers.{}", i);
            decoder_layers.push(DecoderLayerWeights {
                self_attention: attention(source, &format!("{}.mha1", prefix), d)?,
                cross_attention: attention(source, &format!("{}.mha2", prefix), d)?,
                ffn: feed_forward(source, &format!("{}.ffn", prefix), config)?,
                layernorm1: layer_norm(source, &format!("{}.layernorm1", prefix), d)?,
                layernorm2: layer_norm(source, &format!("{}.layernorm2", prefix), d)?,
                layernorm3: layer_norm(source, &format!("{}.layernorm3", prefix), d)?,
            });
        }

        let final_layer = dense(source, "final_layer", d, config.vocab_size)?;

        Ok(Self {
            encoder_embedding,
            encoder_layers,
            decoder_embedding,
            decoder_layers,
            final_layer,
        })
    }

    /// Load weights from a safetensors file, checking every tensor against `config`.
    pub fn load_safetensors(path: impl AsRef<Path>, config: &ModelConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("failed to read weights file {}", path.display()))?;
        let weights = Self::from_safetensors_bytes(&data, config)?;
        info!(
            path = %path.display(),
            tensors = weights.tensor_count(),
            parameters = weights.parameter_count(),
            "loaded model weights"
        );
        Ok(weights)
    }

    pub fn from_safetensors_bytes(data: &[u8], config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let (_, metadata) =
            SafeTensors::read_metadata(data).context("failed to parse safetensors header")?;
        if let Some(layers) = metadata
            .metadata()
            .as_ref()
            .and_then(|meta| meta.get(LAYER_COUNT_KEY))
        {
            if layers.parse::<usize>().ok() != Some(config.num_layers) {
                return Err(CaptionError::InvalidConfig(format!(
                    "weights were exported with {} layers, config expects {}",
                    layers, config.num_layers
                ))
                .into());
            }
        }

        let tensors = SafeTensors::deserialize(data).context("failed to parse safetensors")?;
        Self::build(config, &mut SafeTensorSource { tensors })
    }

    /// Seeded random weights for tests and demos (not for real inference).
    pub fn random(config: &ModelConfig, seed: u64) -> Result<Self> {
        let mut source = RandomSource {
            rng: fastrand::Rng::with_seed(seed),
        };
        Self::build(config, &mut source)
    }

    /// All-zero weights. The final projection then yields identical logits
    /// for every token, i.e. a uniform next-token distribution.
    pub fn zeros(config: &ModelConfig) -> Result<Self> {
        Self::build(config, &mut ZeroSource)
    }

    /// Every tensor paired with its artifact name, in a stable order.
    pub fn named_tensors(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = Vec::new();
        push_dense(&mut out, "encoder.embedding", &self.encoder_embedding);
        for (i, layer) in self.encoder_layers.iter().enumerate() {
            let prefix = format!("encoder.layers.{}", i);
            push_attention(&mut out, &format!("{}.mha", prefix), &layer.attention);
            push_feed_forward(&mut out, &format!("{}.ffn", prefix), &layer.ffn);
            push_layer_norm(&mut out, &format!("{}.layernorm1", prefix), &layer.layernorm1);
            push_layer_norm(&mut out, &format!("{}.layernorm2", prefix), &layer.layernorm2);
        }
        out.push((
            "decoder.embedding".to_string(),
            self.decoder_embedding.view().into_dyn(),
        ));
        for (i, layer) in self.decoder_layers.iter().enumerate() {
            let prefix = format!("decoder.layers.{}", i);
            push_attention(&mut out, &format!("{}.mha1", prefix), &layer.self_attention);
            push_attention(&mut out, &format!("{}.mha2", prefix), &layer.cross_attention);
            push_feed_forward(&mut out, &format!("{}.ffn", prefix), &layer.ffn);
            push_layer_norm(&mut out, &format!("{}.layernorm1", prefix), &layer.layernorm1);
            push_layer_norm(&mut out, &format!("{}.layernorm2", prefix), &layer.layernorm2);
            push_layer_norm(&mut out, &format!("{}.layernorm3", prefix), &layer.layernorm3);
        }
        push_dense(&mut out, "final_layer", &self.final_layer);
        out
    }

    pub fn tensor_count(&self) -> usize {
        self.named_tensors().len()
    }

    pub fn parameter_count(&self) -> usize {
        self.named_tensors().iter().map(|(_, t)| t.len()).sum()
    }

    /// Every tensor name `config` implies, with its shape, in artifact order.
    pub fn expected_shapes(config: &ModelConfig) -> Result<Vec<(String, Vec<usize>)>> {
        let mut source = ShapeSource::default();
        Self::build(config, &mut source)?;
        Ok(source.shapes)
    }

    /// Check that every tensor has the shape `config` implies.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let expected = Self::expected_shapes(config)?;
        let actual: HashMap<String, Vec<usize>> = self
            .named_tensors()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.shape().to_vec()))
            .collect();
        if expected.len() != actual.len() {
            return Err(CaptionError::InvalidConfig(format!(
                "weights hold {} tensors, config implies {}",
                actual.len(),
                expected.len()
            ))
            .into());
        }
        for (name, want) in expected {
            let got = actual
                .get(&name)
                .ok_or_else(|| CaptionError::MissingWeight(name.clone()))?;
            if *got != want {
                return Err(CaptionError::WeightShape {
                    name,
                    expected: want,
                    actual: got.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Serialize in the layout `load_safetensors` reads.
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>> {
        let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .named_tensors()
            .into_iter()
            .map(|(name, tensor)| {
                let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, tensor.shape().to_vec(), bytes)
            })
            .collect();

        let mut views = Vec::with_capacity(encoded.len());
        for (name, shape, bytes) in &encoded {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                .with_context(|| format!("failed to build tensor view for {}", name))?;
            views.push((name.as_str(), view));
        }

        let metadata = HashMap::from([(
            LAYER_COUNT_KEY.to_string(),
            self.encoder_layers.len().to_string(),
        )]);
        safetensors::serialize(views, &Some(metadata)).context("failed to serialize weights")
    }

    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_safetensors_bytes()?)
            .with_context(|| format!("failed to write weights file {}", path.display()))
    }
}

type NamedTensors<'a> = Vec<(String, ArrayViewD<'a, f32>)>;

fn push_dense<'a>(out: &mut NamedTensors<'a>, name: &str, weights: &'a DenseWeights) {
    out.push((format!("{}.kernel", name), weights.kernel.view().into_dyn()));
    out.push((format!("{}.bias", name), weights.bias.view().into_dyn()));
}

fn push_layer_norm<'a>(out: &mut NamedTensors<'a>, name: &str, weights: &'a LayerNormWeights) {
    out.push((format!("{}.gamma", name), weights.gamma.view().into_dyn()));
    out.push((format!("{}.beta", name), weights.beta.view().into_dyn()));
}

fn push_attention<'a>(out: &mut NamedTensors<'a>, name: &str, weights: &'a AttentionWeights) {
    push_dense(out, &format!("{}.wq", name), &weights.wq);
    push_dense(out, &format!("{}.wk", name), &weights.wk);
    push_dense(out, &format!("{}.wv", name), &weights.wv);
    push_dense(out, &format!("{}.dense", name), &weights.dense);
}

fn push_feed_forward<'a>(out: &mut NamedTensors<'a>, name: &str, weights: &'a FeedForwardWeights) {
    push_dense(out, &format!("{}.0", name), &weights.hidden);
    push_dense(out, &format!("{}.1", name), &weights.output);
}

struct SafeTensorSource<'data> {
    tensors: SafeTensors<'data>,
}

impl SafeTensorSource<'_> {
    fn read(&self, name: &str, expected: &[usize]) -> Result<Vec<f32>> {
        let view = self
            .tensors
            .tensor(name)
            .map_err(|_| CaptionError::MissingWeight(name.to_string()))?;

        ensure!(
            view.dtype() == Dtype::F32,
            "tensor '{}' has dtype {:?}, expected F32",
            name,
            view.dtype()
        );
        if view.shape() != expected {
            return Err(CaptionError::WeightShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: view.shape().to_vec(),
            }
            .into());
        }

        Ok(view
            .data()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

impl TensorSource for SafeTensorSource<'_> {
    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let floats = self.read(name, &[rows, cols])?;
        Array2::from_shape_vec((rows, cols), floats).context("failed to reshape tensor")
    }

    fn vector(&mut self, name: &str, len: usize, _fill: VectorFill) -> Result<Array1<f32>> {
        Ok(Array1::from(self.read(name, &[len])?))
    }
}

struct RandomSource {
    rng: fastrand::Rng,
}

impl TensorSource for RandomSource {
    /// Glorot-uniform, the same limit Keras uses for dense kernels.
    fn matrix(&mut self, _name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        let limit = (6.0 / (rows + cols) as f32).sqrt();
        let rng = &mut self.rng;
        Ok(Array2::from_shape_fn((rows, cols), |_| {
            (rng.f32() * 2.0 - 1.0) * limit
        }))
    }

    fn vector(&mut self, _name: &str, len: usize, fill: VectorFill) -> Result<Array1<f32>> {
        Ok(match fill {
            VectorFill::Zeros => Array1::zeros(len),
            VectorFill::Ones => Array1::ones(len),
        })
    }
}

/// Records requested shapes and hands back empty placeholders.
#[derive(Default)]
struct ShapeSource {
    shapes: Vec<(String, Vec<usize>)>,
}

impl TensorSource for ShapeSource {
    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        self.shapes.push((name.to_string(), vec![rows, cols]));
        Ok(Array2::zeros((0, 0)))
    }

    fn vector(&mut self, name: &str, len: usize, _fill: VectorFill) -> Result<Array1<f32>> {
        self.shapes.push((name.to_string(), vec![len]));
        Ok(Array1::zeros(0))
    }
}

struct ZeroSource;

impl TensorSource for ZeroSource {
    fn matrix(&mut self, _name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        Ok(Array2::zeros((rows, cols)))
    }

    fn vector(&mut self, _name: &str, len: usize, _fill: VectorFill) -> Result<Array1<f32>> {
        Ok(Array1::zeros(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caption_error(err: &anyhow::Error) -> Option<&CaptionError> {
        err.downcast_ref::<CaptionError>()
    }

    #[test]
    fn tensor_layout_covers_every_layer() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::zeros(&config).expect("weights");
        // embedding(2) + enc layers * (4 dense*2 + 2 ffn*2 + 2 ln*2) + dec embedding
        // + dec layers * (8 dense*2 + 2 ffn*2 + 3 ln*2) + final(2)
        let expected = 2 + 2 * 16 + 1 + 2 * 26 + 2;
        assert_eq!(weights.tensor_count(), expected);

        let names: Vec<String> = weights.named_tensors().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"decoder.layers.1.mha2.dense.bias".to_string()));
        assert!(names.contains(&"encoder.layers.0.layernorm2.gamma".to_string()));
        assert!(names.contains(&"final_layer.kernel".to_string()));
    }

    #[test]
    fn safetensors_round_trip_preserves_values() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 7).expect("weights");
        let bytes = weights.to_safetensors_bytes().expect("serialize");
        let loaded = ModelWeights::from_safetensors_bytes(&bytes, &config).expect("load");

        for ((name, a), (_, b)) in weights.named_tensors().iter().zip(loaded.named_tensors().iter())
        {
            assert_eq!(a, b, "tensor {} differs", name);
        }
    }

    #[test]
    fn random_weights_are_seeded() {
        let config = ModelConfig::tiny();
        let a = ModelWeights::random(&config, 3).expect("weights");
        let b = ModelWeights::random(&config, 3).expect("weights");
        let c = ModelWeights::random(&config, 4).expect("weights");
        assert_eq!(a.final_layer.kernel, b.final_layer.kernel);
        assert_ne!(a.final_layer.kernel, c.final_layer.kernel);
        assert!(a.encoder_layers[0].layernorm1.gamma.iter().all(|g| *g == 1.0));
    }

    #[test]
    fn layer_count_metadata_must_match_config() {
        let config = ModelConfig::tiny();
        let bytes = ModelWeights::zeros(&config).expect("weights")
            .to_safetensors_bytes()
            .expect("serialize");
        let wider = ModelConfig {
            num_layers: 3,
            ..config
        };
        let err = ModelWeights::from_safetensors_bytes(&bytes, &wider).unwrap_err();
        assert!(matches!(caption_error(&err), Some(CaptionError::InvalidConfig(_))));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let config = ModelConfig::tiny();
        let bytes = ModelWeights::zeros(&config).expect("weights")
            .to_safetensors_bytes()
            .expect("serialize");
        let bigger_vocab = ModelConfig {
            vocab_size: config.vocab_size + 1,
            ..config
        };
        let err = ModelWeights::from_safetensors_bytes(&bytes, &bigger_vocab).unwrap_err();
        match caption_error(&err) {
            Some(CaptionError::WeightShape { name, .. }) => assert_eq!(name, "decoder.embedding"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn absent_tensor_is_missing_weight() {
        let config = ModelConfig::tiny();
        let bytes = ModelWeights::zeros(&config).expect("weights")
            .to_safetensors_bytes()
            .expect("serialize");
        let tensors = SafeTensors::deserialize(&bytes).expect("parse");
        let mut source = SafeTensorSource { tensors };
        let err = source.matrix("decoder.layers.9.mha1.wq.kernel", 16, 16).unwrap_err();
        assert!(matches!(caption_error(&err), Some(CaptionError::MissingWeight(_))));
    }

    #[test]
    fn validate_rejects_foreign_config() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::random(&config, 1).expect("weights");
        weights.validate(&config).expect("own config");
        let other = ModelConfig {
            feed_forward_dim: 64,
            ..config
        };
        match caption_error(&weights.validate(&other).unwrap_err()) {
            Some(CaptionError::WeightShape { name, expected, .. }) => {
                assert_eq!(name, "encoder.layers.0.ffn.0.kernel");
                assert_eq!(expected, &vec![config.d_model, 64]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn expected_shapes_match_built_layout() {
        let config = ModelConfig::tiny();
        let weights = ModelWeights::zeros(&config).expect("weights");
        let expected = ModelWeights::expected_shapes(&config).expect("shapes");
        let built: Vec<(String, Vec<usize>)> = weights
            .named_tensors()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.shape().to_vec()))
            .collect();
        assert_eq!(expected, built);
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        let err = ModelWeights::from_safetensors_bytes(b"not a safetensors file", &ModelConfig::tiny());
        assert!(err.is_err());
    }
}

//! Load-once captioning state shared by every request.

use crate::config::{DecodeConfig, ModelConfig};
use crate::decoding::{BeamSearchDecoder, Caption};
use crate::error::CaptionError;
use crate::transformer::Transformer;
use crate::vocab::Vocabulary;
use crate::weights::ModelWeights;
use anyhow::{Context, Result};
use captionforge_kernels::config::KernelChoice;
use ndarray::{Array3, ArrayViewD};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Immutable after construction; `caption` takes `&self` and allocates all
/// per-call state itself, so one engine can serve concurrent callers.
pub struct CaptionEngine {
    transformer: Transformer,
    vocabulary: Vocabulary,
    decode: DecodeConfig,
}

impl CaptionEngine {
    pub fn new(transformer: Transformer, vocabulary: Vocabulary, decode: DecodeConfig) -> Result<Self> {
        let config = transformer.config();
        decode.validate(config)?;

        for (role, id) in [
            ("start", vocabulary.start_id()),
            ("end", vocabulary.end_id()),
            ("unknown", vocabulary.unknown_id()),
        ] {
            if id >= config.vocab_size {
                return Err(CaptionError::InvalidVocabulary(format!(
                    "{} token id {} is outside the model vocabulary of {}",
                    role, id, config.vocab_size
                ))
                .into());
            }
        }

        Ok(Self {
            transformer,
            vocabulary,
            decode,
        })
    }

    /// Reads both artifacts and builds the engine. Any failure is fatal.
    pub fn load(
        config: ModelConfig,
        decode: DecodeConfig,
        kernel: KernelChoice,
        weights_path: impl AsRef<Path>,
        vocabulary_path: impl AsRef<Path>,
    ) -> Result<Self> {
        config.validate()?;
        let weights = ModelWeights::load_safetensors(weights_path, &config)?;
        let vocabulary = Vocabulary::load_json(vocabulary_path)?;
        let transformer = Transformer::new(config, Arc::new(weights), kernel)?;
        let engine = Self::new(transformer, vocabulary, decode)?;
        info!(
            kernel = engine.transformer.kernel_name(),
            beam_width = engine.decode.beam_width,
            "caption engine ready"
        );
        Ok(engine)
    }

    pub fn model_config(&self) -> &ModelConfig {
        self.transformer.config()
    }

    pub fn decode_config(&self) -> &DecodeConfig {
        &self.decode
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    /// Captions one feature grid, given as `[1, grid_len, feature_dim]` or
    /// `[1, grid_rows, grid_cols, feature_dim]`.
    pub fn caption(&self, features: ArrayViewD<'_, f32>) -> Result<Caption> {
        let grid = self.flatten_grid(features)?;
        let caption = BeamSearchDecoder::new(&self.transformer, &self.vocabulary, &self.decode)
            .decode(grid.view())
            .context("caption decoding failed")?;
        info!(
            steps = caption.steps,
            terminated = caption.terminated_by_end,
            encode_ms = caption.metrics.encode_ms,
            decode_ms = caption.metrics.decode_ms,
            "captioned feature grid"
        );
        Ok(caption)
    }

    fn flatten_grid(&self, features: ArrayViewD<'_, f32>) -> Result<Array3<f32>> {
        let config = self.transformer.config();
        let flat = [1, config.grid_len(), config.feature_dim];
        let spatial = [1, config.grid_rows, config.grid_cols, config.feature_dim];

        let shape = features.shape();
        if shape != flat && shape != spatial {
            return Err(CaptionError::InvalidInputShape {
                expected: flat.to_vec(),
                actual: shape.to_vec(),
            }
            .into());
        }

        let values: Vec<f32> = features.iter().copied().collect();
        Ok(Array3::from_shape_vec(
            (1, config.grid_len(), config.feature_dim),
            values,
        )?)
    }
}

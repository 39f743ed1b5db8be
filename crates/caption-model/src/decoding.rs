//! Autoregressive caption decoding over a shared encoder pass.

use crate::beam::Beam;
use crate::config::DecodeConfig;
use crate::decoder::LayerAttention;
use crate::transformer::Transformer;
use crate::vocab::Vocabulary;
use anyhow::{Context, Result};
use captionforge_kernels::utils::softmax_inplace;
use ndarray::{Array1, ArrayView3, Axis};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecodeMetrics {
    pub encode_ms: f64,
    pub decode_ms: f64,
    pub steps: usize,
    pub steps_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct Caption {
    /// Output words with `<unk>` and other reserved tokens removed.
    pub words: Vec<String>,
    /// Generated ids, without `<start>` and without the terminating `<end>`.
    pub token_ids: Vec<usize>,
    pub steps: usize,
    pub terminated_by_end: bool,
    /// Score of the chosen candidate at each step.
    pub scores: Vec<f32>,
    pub metrics: DecodeMetrics,
    /// Per decoder layer, for the final step. Only filled on request.
    pub attention: Option<Vec<LayerAttention>>,
}

impl Caption {
    pub fn text(&self) -> String {
        self.words.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Drives a [`Transformer`] one token at a time until `<end>` or the step cap.
pub struct BeamSearchDecoder<'a> {
    transformer: &'a Transformer,
    vocabulary: &'a Vocabulary,
    config: &'a DecodeConfig,
}

impl<'a> BeamSearchDecoder<'a> {
    pub fn new(
        transformer: &'a Transformer,
        vocabulary: &'a Vocabulary,
        config: &'a DecodeConfig,
    ) -> Self {
        Self {
            transformer,
            vocabulary,
            config,
        }
    }

    /// Next-token distribution for `tokens`.
    fn probabilities(
        &self,
        enc_output: ArrayView3<'_, f32>,
        tokens: &[usize],
    ) -> Result<(Array1<f32>, Vec<LayerAttention>)> {
        let step = self
            .transformer
            .next_token_logits(enc_output, tokens, self.config.collect_attention)?;
        let mut probs = step.logits.insert_axis(Axis(0));
        softmax_inplace(probs.view_mut());
        Ok((probs.index_axis_move(Axis(0), 0), step.attention))
    }

    pub fn decode(&self, features: ArrayView3<'_, f32>) -> Result<Caption> {
        let encode_start = Instant::now();
        let enc_output = self.transformer.encode(features, None)?;
        let encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

        let start_id = self.vocabulary.start_id();
        let end_id = self.vocabulary.end_id();
        let mut beam = Beam::new(start_id, self.config.beam_width)
            .with_suppressed([self.vocabulary.pad_id(), start_id]);

        let decode_start = Instant::now();
        let mut scores = Vec::with_capacity(self.config.max_decode_steps);
        let mut attention = None;
        let mut terminated_by_end = false;

        for step in 1..=self.config.max_decode_steps {
            let (probs, step_attention) = self
                .probabilities(enc_output.view(), &beam.primary().sequence)
                .with_context(|| format!("decode step {} failed", step))?;
            let chosen = beam.step(probs.view())?;
            let score = beam.primary().score;
            scores.push(score);
            debug!(step, token = chosen, score, "decode step");

            if self.config.collect_attention {
                attention = Some(step_attention);
            }
            if chosen == end_id {
                terminated_by_end = true;
                break;
            }
        }

        let steps = scores.len();
        if !terminated_by_end {
            warn!(steps, "step cap reached without end token");
        }

        let decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
        let steps_per_sec = if decode_ms > 0.0 {
            steps as f64 / (decode_ms / 1000.0)
        } else {
            0.0
        };

        let generated = &beam.primary().sequence[1..];
        let token_ids = if terminated_by_end {
            generated[..generated.len() - 1].to_vec()
        } else {
            generated.to_vec()
        };
        let words = self.vocabulary.decode(&token_ids);

        Ok(Caption {
            words,
            token_ids,
            steps,
            terminated_by_end,
            scores,
            metrics: DecodeMetrics {
                encode_ms,
                decode_ms,
                steps,
                steps_per_sec,
            },
            attention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::weights::ModelWeights;
    use captionforge_kernels::config::KernelChoice;
    use ndarray::Array3;
    use std::sync::Arc;

    fn scenario_vocabulary() -> Vocabulary {
        Vocabulary::from_word_index([("<start>", 1), ("<end>", 2), ("<unk>", 3), ("word_a", 4)])
            .expect("vocabulary")
    }

    fn scenario_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 5,
            ..ModelConfig::tiny()
        }
    }

    fn zero_features(config: &ModelConfig) -> Array3<f32> {
        Array3::zeros((1, config.grid_len(), config.feature_dim))
    }

    #[test]
    fn uniform_logits_terminate_on_end_after_one_step() {
        let config = scenario_config();
        let weights = Arc::new(ModelWeights::zeros(&config).expect("weights"));
        let transformer =
            Transformer::new(config.clone(), weights, KernelChoice::Reference).expect("model");
        let vocab = scenario_vocabulary();
        let decode = DecodeConfig::default();

        let caption = BeamSearchDecoder::new(&transformer, &vocab, &decode)
            .decode(zero_features(&config).view())
            .expect("decode");

        assert_eq!(caption.steps, 1);
        assert!(caption.terminated_by_end);
        assert!(caption.words.is_empty());
        assert!(caption.token_ids.is_empty());
        assert_eq!(caption.text(), "");
    }

    #[test]
    fn end_favoured_by_bias_terminates_immediately() {
        let config = scenario_config();
        let mut weights = ModelWeights::random(&config, 17).expect("weights");
        weights.final_layer.bias[2] = 50.0;
        let transformer = Transformer::new(config.clone(), Arc::new(weights), KernelChoice::Reference)
            .expect("model");
        let vocab = scenario_vocabulary();
        let decode = DecodeConfig::default();

        let caption = BeamSearchDecoder::new(&transformer, &vocab, &decode)
            .decode(zero_features(&config).view())
            .expect("decode");
        assert_eq!(caption.steps, 1);
        assert!(caption.is_empty());
    }

    #[test]
    fn step_cap_returns_partial_sequence() {
        let config = scenario_config();
        let mut weights = ModelWeights::random(&config, 17).expect("weights");
        weights.final_layer.bias[4] = 50.0;
        let transformer = Transformer::new(config.clone(), Arc::new(weights), KernelChoice::Reference)
            .expect("model");
        let vocab = scenario_vocabulary();
        let decode = DecodeConfig {
            max_decode_steps: 5,
            ..DecodeConfig::default()
        };

        let caption = BeamSearchDecoder::new(&transformer, &vocab, &decode)
            .decode(zero_features(&config).view())
            .expect("decode");
        assert!(!caption.terminated_by_end);
        assert_eq!(caption.steps, 5);
        assert_eq!(caption.token_ids, vec![4; 5]);
        assert_eq!(caption.text(), "word_a word_a word_a word_a word_a");
    }

    #[test]
    fn unknown_tokens_are_filtered_from_words() {
        let config = scenario_config();
        let mut weights = ModelWeights::random(&config, 17).expect("weights");
        weights.final_layer.bias[3] = 50.0;
        let transformer = Transformer::new(config.clone(), Arc::new(weights), KernelChoice::Reference)
            .expect("model");
        let vocab = scenario_vocabulary();
        let decode = DecodeConfig {
            max_decode_steps: 3,
            ..DecodeConfig::default()
        };

        let caption = BeamSearchDecoder::new(&transformer, &vocab, &decode)
            .decode(zero_features(&config).view())
            .expect("decode");
        assert_eq!(caption.token_ids, vec![3, 3, 3]);
        assert!(caption.words.is_empty());
    }

    #[test]
    fn decoding_is_idempotent() {
        let config = ModelConfig::tiny();
        let weights = Arc::new(ModelWeights::random(&config, 23).expect("weights"));
        let transformer =
            Transformer::new(config.clone(), weights, KernelChoice::Parallel).expect("model");
        let vocab = Vocabulary::synthetic(config.vocab_size).expect("vocabulary");
        let decode = DecodeConfig {
            max_decode_steps: 12,
            collect_attention: true,
            ..DecodeConfig::default()
        };
        let features = Array3::from_shape_fn((1, config.grid_len(), config.feature_dim), |(_, i, j)| {
            ((i + 2 * j) % 7) as f32 / 7.0
        });

        let decoder = BeamSearchDecoder::new(&transformer, &vocab, &decode);
        let first = decoder.decode(features.view()).expect("first");
        let second = decoder.decode(features.view()).expect("second");
        assert_eq!(first.token_ids, second.token_ids);
        assert_eq!(first.scores, second.scores);
        assert_eq!(first.steps, first.scores.len());

        let attention = first.attention.expect("attention requested");
        assert_eq!(attention.len(), config.num_layers);
    }
}

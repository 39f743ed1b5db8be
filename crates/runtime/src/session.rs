//! Caption session orchestration.

use crate::config::RuntimeConfig;
use crate::features::load_features;
use anyhow::{Context, Result};
use captionforge_model::{
    Caption, CaptionEngine, DecodeMetrics, ModelWeights, Transformer, Vocabulary,
};
use ndarray::ArrayViewD;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Where the session's weights and vocabulary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    Files,
    Demo,
}

/// JSON-friendly summary of one caption request.
#[derive(Debug, Clone, Serialize)]
pub struct CaptionReport {
    pub request: u64,
    pub caption: String,
    pub words: Vec<String>,
    pub token_ids: Vec<usize>,
    pub steps: usize,
    pub terminated_by_end: bool,
    pub scores: Vec<f32>,
    pub metrics: DecodeMetrics,
    /// `[heads, query, key]` of each layer's cross-attention, when collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_attention_shapes: Option<Vec<Vec<usize>>>,
}

impl CaptionReport {
    pub fn new(request: u64, caption: &Caption) -> Self {
        let cross_attention_shapes = caption.attention.as_ref().map(|layers| {
            layers
                .iter()
                .map(|layer| layer.cross_attention.shape()[1..].to_vec())
                .collect()
        });
        Self {
            request,
            caption: caption.text(),
            words: caption.words.clone(),
            token_ids: caption.token_ids.clone(),
            steps: caption.steps,
            terminated_by_end: caption.terminated_by_end,
            scores: caption.scores.clone(),
            metrics: caption.metrics.clone(),
            cross_attention_shapes,
        }
    }
}

/// Engine loaded once and shared read-only by every caller.
pub struct CaptionSession {
    engine: Arc<CaptionEngine>,
    source: ArtifactSource,
    requests: AtomicU64,
}

impl CaptionSession {
    /// Loads weights and vocabulary named by `config`. Both are required
    /// unless `config.demo` is set, in which case missing ones are replaced
    /// by seeded random weights and the synthetic vocabulary.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let RuntimeConfig {
            model,
            decode,
            kernel,
            weights,
            vocabulary,
            demo: _,
            demo_seed,
        } = config;

        let source = if weights.is_some() && vocabulary.is_some() {
            ArtifactSource::Files
        } else {
            ArtifactSource::Demo
        };

        let model_weights = match &weights {
            Some(path) => ModelWeights::load_safetensors(path, &model)?,
            None => {
                warn!(seed = demo_seed, "demo mode: using random weights (not pretrained)");
                ModelWeights::random(&model, demo_seed)?
            }
        };
        let vocabulary = match &vocabulary {
            Some(path) => Vocabulary::load_json(path)?,
            None => {
                warn!(size = model.vocab_size, "demo mode: using synthetic vocabulary");
                Vocabulary::synthetic(model.vocab_size)?
            }
        };

        let transformer = Transformer::new(model, Arc::new(model_weights), kernel)
            .context("failed to assemble transformer")?;
        let engine = CaptionEngine::new(transformer, vocabulary, decode)?;
        info!(
            kernel = kernel.as_str(),
            source = ?source,
            vocabulary = engine.vocabulary().len(),
            "caption session opened"
        );

        Ok(Self {
            engine: Arc::new(engine),
            source,
            requests: AtomicU64::new(0),
        })
    }

    pub fn from_engine(engine: Arc<CaptionEngine>) -> Self {
        Self {
            engine,
            source: ArtifactSource::Files,
            requests: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<CaptionEngine> {
        &self.engine
    }

    pub fn source(&self) -> ArtifactSource {
        self.source
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn caption(&self, features: ArrayViewD<'_, f32>) -> Result<Caption> {
        self.caption_with_id(features).map(|(_, caption)| caption)
    }

    pub fn caption_report(&self, features: ArrayViewD<'_, f32>) -> Result<CaptionReport> {
        let (request, caption) = self.caption_with_id(features)?;
        Ok(CaptionReport::new(request, &caption))
    }

    pub fn caption_file(&self, path: impl AsRef<Path>) -> Result<CaptionReport> {
        let features = load_features(path)?;
        self.caption_report(features.view())
    }

    fn caption_with_id(&self, features: ArrayViewD<'_, f32>) -> Result<(u64, Caption)> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let caption = self.engine.caption(features)?;
        info!(
            request,
            words = caption.words.len(),
            steps_per_sec = caption.metrics.steps_per_sec,
            "request completed"
        );
        Ok((request, caption))
    }
}

//! Transformer encoder-decoder for image captioning.
//!
//! This crate implements:
//! - 1-D and 2-D sinusoidal positional encodings
//! - Multi-head attention, encoder and decoder stacks
//! - Safetensors weight loading with per-tensor shape checks
//! - A word vocabulary with reserved start/end/unknown tokens
//! - Beam-search decoding driven one token at a time
//!
//! [`CaptionEngine`] bundles the immutable loaded state and is the usual
//! entry point.

pub mod attention;
pub mod beam;
pub mod config;
pub mod decoder;
pub mod decoding;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod feed_forward;
pub mod mask;
pub mod positional;
pub mod transformer;
pub mod vocab;
pub mod weights;

pub use beam::{Beam, BeamCandidate};
pub use config::{DecodeConfig, ModelConfig};
pub use decoder::LayerAttention;
pub use decoding::{BeamSearchDecoder, Caption, DecodeMetrics};
pub use engine::CaptionEngine;
pub use error::CaptionError;
pub use transformer::Transformer;
pub use vocab::{Vocabulary, VocabularyFile};
pub use weights::ModelWeights;

pub use captionforge_kernels::config::KernelChoice;

//! Errors callers are expected to match on.
//!
//! Everything else travels as a plain `anyhow::Error` with context attached.
//! These variants are raised through `anyhow` too; recover them with
//! `err.downcast_ref::<CaptionError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptionError {
    /// Feature grid handed to the engine has the wrong rank or dimensions.
    #[error("invalid input shape: expected {expected:?}, got {actual:?}")]
    InvalidInputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Model or decode configuration is internally inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A tensor the model needs is absent from the weight artifact.
    #[error("missing weight tensor '{0}'")]
    MissingWeight(String),

    /// A tensor is present but does not match the configured dimensions.
    #[error("weight '{name}' has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Vocabulary artifact violates a reserved-token or uniqueness rule.
    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),
}

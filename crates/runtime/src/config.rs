//! Deployment configuration read from a JSON file.

use anyhow::{Context, Result};
use captionforge_model::{CaptionError, DecodeConfig, KernelChoice, ModelConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Seed for demo weights when no weight artifact is configured.
pub const DEFAULT_DEMO_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub model: ModelConfig,
    pub decode: DecodeConfig,
    pub kernel: KernelChoice,
    /// Safetensors weight artifact. Required unless `demo` is set.
    pub weights: Option<PathBuf>,
    /// Vocabulary JSON artifact. Required unless `demo` is set.
    pub vocabulary: Option<PathBuf>,
    /// Allow seeded random weights and the synthetic vocabulary in place of
    /// missing artifacts.
    pub demo: bool,
    pub demo_seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            decode: DecodeConfig::default(),
            kernel: KernelChoice::default(),
            weights: None,
            vocabulary: None,
            demo: false,
            demo_seed: DEFAULT_DEMO_SEED,
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read runtime config {}", path.display()))?;
        let config = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }

    /// Fails when an artifact is missing and demo mode is off.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.decode.validate(&self.model)?;
        if !self.demo {
            if self.weights.is_none() {
                return Err(CaptionError::InvalidConfig(
                    "no weight artifact configured (pass weights or enable demo mode)".into(),
                )
                .into());
            }
            if self.vocabulary.is_none() {
                return Err(CaptionError::InvalidConfig(
                    "no vocabulary artifact configured (pass a vocabulary or enable demo mode)"
                        .into(),
                )
                .into());
            }
        }
        Ok(())
    }
}

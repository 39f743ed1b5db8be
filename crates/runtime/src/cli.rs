//! CLI wiring for the captioning runtime.

use crate::config::RuntimeConfig;
use crate::session::CaptionSession;
use anyhow::Result;
use captionforge_model::{KernelChoice, ModelWeights, Vocabulary};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "captionforge", about = "Transformer image-caption inference")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum KernelArg {
    Reference,
    Parallel,
}

impl From<KernelArg> for KernelChoice {
    fn from(value: KernelArg) -> KernelChoice {
        match value {
            KernelArg::Reference => KernelChoice::Reference,
            KernelArg::Parallel => KernelChoice::Parallel,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Caption a feature grid stored as a safetensors file.
    Caption {
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        weights: Option<PathBuf>,
        #[arg(long)]
        vocabulary: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        beam_width: Option<usize>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long, value_enum)]
        kernel: Option<KernelArg>,
        /// Run on seeded random weights and the synthetic vocabulary when
        /// `--weights` or `--vocabulary` is not given.
        #[arg(long, default_value_t = false)]
        demo: bool,
        /// Collect per-layer attention for the final step.
        #[arg(long, default_value_t = false)]
        attention: bool,
        /// Print a JSON report instead of the caption text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Write seeded random weights in the artifact layout.
    ExportWeights {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = crate::config::DEFAULT_DEMO_SEED)]
        seed: u64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write the synthetic vocabulary artifact.
    ExportVocabulary {
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a weight and vocabulary pair and print a summary.
    Inspect {
        #[arg(long)]
        weights: PathBuf,
        #[arg(long)]
        vocabulary: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Caption {
            features,
            weights,
            vocabulary,
            config,
            beam_width,
            max_steps,
            kernel,
            demo,
            attention,
            json,
        } => {
            let mut runtime = load_config(config.as_deref())?;
            if weights.is_some() {
                runtime.weights = weights;
            }
            if vocabulary.is_some() {
                runtime.vocabulary = vocabulary;
            }
            if let Some(width) = beam_width {
                runtime.decode.beam_width = width;
            }
            if let Some(steps) = max_steps {
                runtime.decode.max_decode_steps = steps;
            }
            if let Some(kernel) = kernel {
                runtime.kernel = kernel.into();
            }
            runtime.demo |= demo;
            runtime.decode.collect_attention |= attention;

            let session = CaptionSession::open(runtime)?;
            let report = session.caption_file(&features)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.caption);
                info!(
                    steps = report.steps,
                    terminated = report.terminated_by_end,
                    encode_ms = report.metrics.encode_ms,
                    decode_ms = report.metrics.decode_ms,
                    "caption finished"
                );
            }
        }
        Command::ExportWeights {
            output,
            seed,
            config,
        } => {
            let runtime = load_config(config.as_deref())?;
            runtime.model.validate()?;
            let weights = ModelWeights::random(&runtime.model, seed)?;
            weights.save_safetensors(&output)?;
            println!(
                "wrote {} tensors ({} parameters) to {}",
                weights.tensor_count(),
                weights.parameter_count(),
                output.display()
            );
        }
        Command::ExportVocabulary { output, config } => {
            let runtime = load_config(config.as_deref())?;
            let vocabulary = Vocabulary::synthetic(runtime.model.vocab_size)?;
            vocabulary.save_json(&output)?;
            println!("wrote {} words to {}", vocabulary.len(), output.display());
        }
        Command::Inspect {
            weights,
            vocabulary,
            config,
        } => {
            let runtime = RuntimeConfig {
                weights: Some(weights),
                vocabulary: Some(vocabulary),
                ..load_config(config.as_deref())?
            };
            let session = CaptionSession::open(runtime)?;
            let engine = session.engine();
            let model = engine.model_config();
            let store = engine.transformer().weights();
            let vocab = engine.vocabulary();

            println!("layers={} d_model={} heads={}", model.num_layers, model.d_model, model.num_heads);
            println!(
                "tensors={} parameters={}",
                store.tensor_count(),
                store.parameter_count()
            );
            println!(
                "vocabulary={} start={} end={} unknown={}",
                vocab.len(),
                vocab.start_id(),
                vocab.end_id(),
                vocab.unknown_id()
            );
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::load_or_default(path)?;
    if let Some(path) = path {
        info!(path = %path.display(), "loaded runtime config");
    }
    Ok(config)
}

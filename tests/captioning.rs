use anyhow::Result;
use captionforge_model::{CaptionError, DecodeConfig, ModelConfig, ModelWeights, Vocabulary};
use captionforge_runtime::cli::{Cli, Command, KernelArg};
use captionforge_runtime::{save_features, ArtifactSource, CaptionSession, RuntimeConfig};
use clap::Parser;
use ndarray::{Array, ArrayD, IxDyn};
use std::fs;
use std::path::PathBuf;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("captionforge-it-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn spatial_grid(config: &ModelConfig, value: impl Fn(usize, usize, usize) -> f32) -> ArrayD<f32> {
    Array::from_shape_fn(
        IxDyn(&[1, config.grid_rows, config.grid_cols, config.feature_dim]),
        |ix| value(ix[1], ix[2], ix[3]),
    )
}

#[test]
fn zero_weights_caption_is_empty_after_one_step() -> Result<()> {
    let dir = scratch_dir("zeros");
    let model = ModelConfig {
        vocab_size: 5,
        ..ModelConfig::tiny()
    };

    let weights_path = dir.join("weights.safetensors");
    let vocab_path = dir.join("vocab.json");
    let features_path = dir.join("features.safetensors");
    ModelWeights::zeros(&model)?.save_safetensors(&weights_path)?;
    fs::write(
        &vocab_path,
        r#"{"word_index": {"<start>": 1, "<end>": 2, "<unk>": 3, "word_a": 4}}"#,
    )?;
    save_features(&features_path, spatial_grid(&model, |_, _, _| 0.0).view())?;

    let session = CaptionSession::open(RuntimeConfig {
        model,
        weights: Some(weights_path),
        vocabulary: Some(vocab_path),
        ..RuntimeConfig::default()
    })?;
    assert_eq!(session.source(), ArtifactSource::Files);

    let report = session.caption_file(&features_path)?;
    assert_eq!(report.steps, 1);
    assert!(report.terminated_by_end);
    assert!(report.words.is_empty());
    assert_eq!(report.caption, "");

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn exported_artifacts_match_demo_session() -> Result<()> {
    let dir = scratch_dir("export");
    let model = ModelConfig::tiny();
    let decode = DecodeConfig {
        max_decode_steps: 10,
        ..DecodeConfig::default()
    };
    let seed = 99;

    let weights_path = dir.join("weights.safetensors");
    let vocab_path = dir.join("vocab.json");
    ModelWeights::random(&model, seed)?.save_safetensors(&weights_path)?;
    Vocabulary::synthetic(model.vocab_size)?.save_json(&vocab_path)?;

    let demo = CaptionSession::open(RuntimeConfig {
        model: model.clone(),
        decode: decode.clone(),
        demo: true,
        demo_seed: seed,
        ..RuntimeConfig::default()
    })?;
    let loaded = CaptionSession::open(RuntimeConfig {
        model: model.clone(),
        decode,
        weights: Some(weights_path),
        vocabulary: Some(vocab_path),
        ..RuntimeConfig::default()
    })?;

    let grid = spatial_grid(&model, |r, c, f| ((r * 7 + c * 3 + f) % 10) as f32 / 10.0);
    let a = demo.caption(grid.view())?;
    let b = loaded.caption(grid.view())?;
    assert_eq!(a.token_ids, b.token_ids);
    assert_eq!(a.words, b.words);
    assert!(a.steps <= 10);

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn weights_for_another_config_are_rejected_at_open() -> Result<()> {
    let dir = scratch_dir("mismatch");
    let weights_path = dir.join("weights.safetensors");
    let tiny = ModelConfig::tiny();
    ModelWeights::random(&tiny, 1)?.save_safetensors(&weights_path)?;

    let wider = ModelConfig {
        d_model: 32,
        ..tiny
    };
    let err = match CaptionSession::open(RuntimeConfig {
        model: wider,
        weights: Some(weights_path),
        demo: true,
        ..RuntimeConfig::default()
    }) {
        Ok(_) => panic!("mismatched weights were accepted"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<CaptionError>(),
        Some(CaptionError::WeightShape { .. })
    ));

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[test]
fn session_without_artifacts_refuses_to_open() {
    let config = RuntimeConfig {
        model: ModelConfig::tiny(),
        ..RuntimeConfig::default()
    };
    let err = match CaptionSession::open(config) {
        Ok(_) => panic!("session opened without a weight artifact"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<CaptionError>(),
        Some(CaptionError::InvalidConfig(_))
    ));
}

#[test]
fn cli_accepts_demo_opt_in() {
    let cli = Cli::parse_from(["captionforge", "caption", "--features", "grid.safetensors", "--demo"]);
    assert!(matches!(cli.command, Command::Caption { demo: true, .. }));
}

#[test]
fn invalid_head_count_is_fatal() {
    let config = RuntimeConfig {
        model: ModelConfig {
            num_heads: 3,
            ..ModelConfig::tiny()
        },
        ..RuntimeConfig::default()
    };
    assert!(CaptionSession::open(config).is_err());
}

#[test]
fn cli_parses_caption_overrides() {
    let cli = Cli::parse_from([
        "captionforge",
        "caption",
        "--features",
        "grid.safetensors",
        "--beam-width",
        "5",
        "--kernel",
        "parallel",
        "--json",
    ]);
    match cli.command {
        Command::Caption {
            features,
            beam_width,
            kernel,
            json,
            attention,
            weights,
            demo,
            ..
        } => {
            assert_eq!(features, PathBuf::from("grid.safetensors"));
            assert_eq!(beam_width, Some(5));
            assert!(matches!(kernel, Some(KernelArg::Parallel)));
            assert!(json);
            assert!(!attention);
            assert!(weights.is_none());
            assert!(!demo);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn cli_requires_features_for_caption() {
    assert!(Cli::try_parse_from(["captionforge", "caption"]).is_err());
}

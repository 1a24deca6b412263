// src/checkpoint.rs

//! Checkpoint save/load for GptModel
//!
//! Keeps config and weights separate to avoid Record type coercion issues

use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use std::path::Path;

use crate::config::GptConfig;
use crate::gpt::GptModel;

const CONFIG_FILE: &str = "config.json";
const RECORD_FILE: &str = "model.mpk";

/// Save model and config to checkpoint directory
pub fn save_checkpoint<B: Backend>(
    model: &GptModel<B>,
    config: &GptConfig,
    checkpoint_dir: impl AsRef<Path>,
) -> Result<()> {
    let dir = checkpoint_dir.as_ref();
    std::fs::create_dir_all(dir).context("Failed to create checkpoint directory")?;

    config.to_json_file(dir.join(CONFIG_FILE))?;

    // MessagePack record, named by module path
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(dir.join(RECORD_FILE), &recorder)
        .context("Failed to save model record")?;

    log::info!("Checkpoint saved to {:?}", dir);
    Ok(())
}

/// Load model from checkpoint directory
pub fn load_checkpoint<B: Backend>(
    checkpoint_dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(GptModel<B>, GptConfig)> {
    let dir = checkpoint_dir.as_ref();

    let config = GptConfig::from_json_file(dir.join(CONFIG_FILE))?;

    let model = GptModel::<B>::new(&config, device)?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(dir.join(RECORD_FILE), &recorder, device)
        .context("Failed to load model record")?;

    log::info!("Checkpoint loaded from {:?}", dir);
    Ok((model, config))
}

/// Save only model weights (for fine-tuning scenarios where config is known)
pub fn save_weights<B: Backend>(model: &GptModel<B>, weights_path: impl AsRef<Path>) -> Result<()> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(weights_path.as_ref(), &recorder)
        .context("Failed to save model weights")?;
    log::info!("Weights saved to {:?}", weights_path.as_ref());
    Ok(())
}

/// Load weights into an existing model
pub fn load_weights<B: Backend>(
    model: GptModel<B>,
    weights_path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<GptModel<B>> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(weights_path.as_ref(), &recorder, device)
        .context("Failed to load model weights")?;
    log::info!("Weights loaded from {:?}", weights_path.as_ref());
    Ok(model)
}

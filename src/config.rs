// src/config.rs

//! Construction parameters for the class-conditional GPT.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    /// Number of discrete codes the quantizer can emit.
    pub vocab_size: usize,
    /// Maximum context length (conditioning + tokens).
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    /// Dropout on the class + code token embeddings, before positions are added.
    #[serde(default = "default_drop")]
    pub token_pdrop: f64,
    /// Dropout on summed token + position embeddings.
    pub embd_pdrop: f64,
    /// Dropout after the attention projection and after the MLP.
    pub resid_pdrop: f64,
    /// Dropout on attention weights.
    pub attn_pdrop: f64,
    /// Leading square of the causal mask that is fully visible.
    #[serde(default)]
    pub n_unmasked: usize,
    pub num_classes: usize,
    /// Probability that a training label is replaced by the unconditional class.
    pub label_dropout: f64,
    /// Number of class-conditioning positions prepended to the tokens.
    pub cls_token_number: usize,
    /// Width of an externally pretrained codebook; `Some` adds a projection to `n_embd`.
    #[serde(default)]
    pub n_codebook_embd: Option<usize>,
}

fn default_drop() -> f64 {
    0.1
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            vocab_size: 262_144,
            block_size: 256,
            n_layer: 12,
            n_head: 8,
            n_embd: 256,
            token_pdrop: 0.1,
            embd_pdrop: 0.0,
            resid_pdrop: 0.0,
            attn_pdrop: 0.0,
            n_unmasked: 0,
            num_classes: 1000,
            label_dropout: 0.1,
            cls_token_number: 1,
            n_codebook_embd: None,
        }
    }
}

impl GptConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Index of the "unconditional" class used for classifier-free guidance.
    pub fn null_class(&self) -> usize {
        self.num_classes
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embd", self.n_embd),
            ("num_classes", self.num_classes),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize(name));
            }
        }
        if self.n_codebook_embd == Some(0) {
            return Err(ConfigError::ZeroSize("n_codebook_embd"));
        }

        if self.n_embd % self.n_head != 0 {
            return Err(ConfigError::HeadSplit {
                n_embd: self.n_embd,
                n_head: self.n_head,
            });
        }

        for (name, value) in [
            ("token_pdrop", self.token_pdrop),
            ("embd_pdrop", self.embd_pdrop),
            ("resid_pdrop", self.resid_pdrop),
            ("attn_pdrop", self.attn_pdrop),
            ("label_dropout", self.label_dropout),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Probability { name, value });
            }
        }

        if self.cls_token_number == 0 || self.cls_token_number > self.block_size {
            return Err(ConfigError::ClassTokens {
                cls_token_number: self.cls_token_number,
                block_size: self.block_size,
            });
        }

        if self.n_unmasked > self.block_size {
            return Err(ConfigError::Unmasked {
                n_unmasked: self.n_unmasked,
                block_size: self.block_size,
            });
        }

        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open config file: {:?}", path))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create config file: {:?}", path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .context("Failed to serialize config")?;
        Ok(())
    }
}

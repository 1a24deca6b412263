// src/error.rs

//! Error types for model construction and generation.

use thiserror::Error;

/// Invalid construction parameters, detected before any weight is allocated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    ZeroSize(&'static str),

    #[error("n_embd ({n_embd}) must be divisible by n_head ({n_head})")]
    HeadSplit { n_embd: usize, n_head: usize },

    #[error("{name} must be in [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },

    #[error("cls_token_number ({cls_token_number}) must be in 1..={block_size}")]
    ClassTokens {
        cls_token_number: usize,
        block_size: usize,
    },

    #[error("n_unmasked ({n_unmasked}) exceeds block_size ({block_size})")]
    Unmasked { n_unmasked: usize, block_size: usize },
}

#[derive(Error, Debug)]
pub enum GptError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot forward {requested} positions, model block size is {block_size}")]
    BlockSizeExceeded { requested: usize, block_size: usize },

    #[error("kv cache shape {actual:?} =/= expected {expected:?}")]
    CacheShapeMismatch {
        expected: [usize; 6],
        actual: [usize; 6],
    },

    #[error("incremental decoding takes exactly one new position, got {0}")]
    InvalidIncrementalInput(usize),

    #[error("temperature must be positive, got {0}")]
    InvalidTemperature(f64),

    #[error("top_k must be positive, got {0}")]
    InvalidTopK(usize),

    #[error("top_p must be in (0, 1], got {0}")]
    InvalidTopP(f64),

    #[error("at least one of top_k / top_p must be set")]
    NoFilter,

    #[error("guidance scale must be finite and >= 0, got {0}")]
    InvalidGuidanceScale(f64),

    #[error("conditioning batch is empty")]
    EmptyConditioning,

    #[error("codebook: {0}")]
    Codebook(String),
}

pub type Result<T> = std::result::Result<T, GptError>;

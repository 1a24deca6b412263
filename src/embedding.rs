// src/embedding.rs

//! Embedding stage: code ids and class labels → hidden states.
//!
//! Layout of the produced sequence, along the time axis:
//!
//! ```text
//! [ prepended embeddings | class tokens (cls_token_number) | code tokens ]
//! ```
//!
//! A learned absolute positional table is added to the whole span.

use burn::{
    module::{Module, Param},
    nn::{Dropout, DropoutConfig, Embedding, Linear},
    tensor::{Bool, Distribution, Int, Tensor, TensorData, backend::Backend},
};
use log::{debug, info};
use safetensors::{Dtype, SafeTensors};
use std::path::Path;

use crate::config::GptConfig;
use crate::error::{GptError, Result};
use crate::init;

/// Tensor name of the quantizer codebook inside tokenizer checkpoints.
pub const CODEBOOK_TENSOR: &str = "quantize.embedding.weight";

// ─────────────────────────────────────────────────────────────────────────────
// Code token embedding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct TokenEmbedding<B: Backend> {
    table: Embedding<B>,
    /// `n_codebook_embd → n_embd`, present only for codebook-width tables.
    projection: Option<Linear<B>>,
    frozen: bool,
}

impl<B: Backend> TokenEmbedding<B> {
    pub fn new(cfg: &GptConfig, device: &B::Device) -> Self {
        match cfg.n_codebook_embd {
            Some(width) => {
                debug!(
                    "TokenEmbedding: codebook table {}x{} projected to {}",
                    cfg.vocab_size, width, cfg.n_embd
                );
                Self {
                    table: init::embedding(cfg.vocab_size, width, device),
                    projection: Some(init::linear(width, cfg.n_embd, true, device)),
                    frozen: false,
                }
            }
            None => Self {
                table: init::embedding(cfg.vocab_size, cfg.n_embd, device),
                projection: None,
                frozen: false,
            },
        }
    }

    /// Replace the table with a frozen pretrained codebook `[vocab_size, n_codebook_embd]`.
    pub fn with_codebook(mut self, codebook: Tensor<B, 2>) -> Result<Self> {
        let expected = self.table.weight.dims();
        let actual = codebook.dims();
        if self.projection.is_none() {
            return Err(GptError::Codebook(
                "model was built without n_codebook_embd".to_string(),
            ));
        }
        if expected != actual {
            return Err(GptError::Codebook(format!(
                "codebook shape {:?} does not match table shape {:?}",
                actual, expected
            )));
        }
        self.table = init::frozen_embedding(codebook);
        self.frozen = true;
        info!("TokenEmbedding: pretrained codebook installed (frozen)");
        Ok(self)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Lookup table `[vocab_size, width]`.
    pub fn table_weight(&self) -> Tensor<B, 2> {
        self.table.weight.val()
    }

    /// `[B, T] → [B, T, n_embd]`
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let x = self.table.forward(ids);
        match &self.projection {
            Some(proj) => proj.forward(x),
            None => x,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Class label embedding with label dropout
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct LabelEmbedder<B: Backend> {
    /// `num_classes + 1` rows; the last row is the unconditional class.
    table: Embedding<B>,
    num_classes: usize,
    dropout_prob: f64,
}

impl<B: Backend> LabelEmbedder<B> {
    pub fn new(num_classes: usize, hidden: usize, dropout_prob: f64, device: &B::Device) -> Self {
        Self {
            table: init::embedding(num_classes + 1, hidden, device),
            num_classes,
            dropout_prob,
        }
    }

    pub fn null_class(&self) -> usize {
        self.num_classes
    }

    /// Replace labels by the unconditional class.
    ///
    /// `force_drop` selects rows explicitly (true = drop); otherwise each row is
    /// dropped independently with probability `dropout_prob`.
    pub fn token_drop(
        &self,
        labels: Tensor<B, 1, Int>,
        force_drop: Option<Tensor<B, 1, Bool>>,
    ) -> Tensor<B, 1, Int> {
        let drop = match force_drop {
            Some(mask) => mask,
            None => {
                let [b] = labels.dims();
                Tensor::<B, 1>::random([b], Distribution::Uniform(0.0, 1.0), &labels.device())
                    .lower_elem(self.dropout_prob)
            }
        };
        labels.mask_fill(drop, self.num_classes as i64)
    }

    /// `[B] → [B, 1, hidden]`
    pub fn forward(
        &self,
        labels: Tensor<B, 1, Int>,
        train: bool,
        force_drop: Option<Tensor<B, 1, Bool>>,
    ) -> Tensor<B, 3> {
        let use_dropout = self.dropout_prob > 0.0;
        let labels = if (train && use_dropout) || force_drop.is_some() {
            self.token_drop(labels, force_drop)
        } else {
            labels
        };
        let [b] = labels.dims();
        self.table.forward(labels.reshape([b, 1]))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Full embedding stage
// ─────────────────────────────────────────────────────────────────────────────

/// What a single incremental step consumes.
#[derive(Debug, Clone)]
pub enum StepInput<B: Backend> {
    /// First step: class labels `[B]`, expanded to the class-token prefix.
    Labels(Tensor<B, 1, Int>),
    /// Later steps: previously chosen code ids `[B, T]`.
    Tokens(Tensor<B, 2, Int>),
}

impl<B: Backend> StepInput<B> {
    pub fn batch(&self) -> usize {
        match self {
            StepInput::Labels(labels) => labels.dims()[0],
            StepInput::Tokens(ids) => ids.dims()[0],
        }
    }
}

#[derive(Module, Debug)]
pub struct EmbeddingStage<B: Backend> {
    tok_emb: TokenEmbedding<B>,
    class_emb: LabelEmbedder<B>,
    pos_emb: Param<Tensor<B, 3>>,
    token_drop: Dropout,
    drop: Dropout,
    block_size: usize,
    cls_token_number: usize,
}

impl<B: Backend> EmbeddingStage<B> {
    pub fn new(cfg: &GptConfig, device: &B::Device) -> Self {
        Self {
            tok_emb: TokenEmbedding::new(cfg, device),
            class_emb: LabelEmbedder::new(cfg.num_classes, cfg.n_embd, cfg.label_dropout, device),
            pos_emb: init::positional(cfg.block_size, cfg.n_embd, device),
            token_drop: DropoutConfig::new(cfg.token_pdrop).init(),
            drop: DropoutConfig::new(cfg.embd_pdrop).init(),
            block_size: cfg.block_size,
            cls_token_number: cfg.cls_token_number,
        }
    }

    pub fn with_codebook(mut self, codebook: Tensor<B, 2>) -> Result<Self> {
        self.tok_emb = self.tok_emb.with_codebook(codebook)?;
        Ok(self)
    }

    pub fn token_embedding(&self) -> &TokenEmbedding<B> {
        &self.tok_emb
    }

    pub fn label_embedder(&self) -> &LabelEmbedder<B> {
        &self.class_emb
    }

    pub fn cls_token_number(&self) -> usize {
        self.cls_token_number
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Replace the zero-initialized positional table with N(0, 1) rows.
    #[cfg(test)]
    pub(crate) fn randomize_positions(mut self) -> Self {
        let [_, block, c] = self.pos_emb.dims();
        let device = self.pos_emb.device();
        self.pos_emb = Param::from_tensor(Tensor::random(
            [1, block, c],
            Distribution::Normal(0.0, 1.0),
            &device,
        ));
        self
    }

    /// Class-token prefix `[B, cls_token_number, C]`.
    fn class_tokens(
        &self,
        labels: Tensor<B, 1, Int>,
        train: bool,
        force_drop: Option<Tensor<B, 1, Bool>>,
    ) -> Tensor<B, 3> {
        let emb = self.class_emb.forward(labels, train, force_drop);
        if self.cls_token_number == 1 {
            emb
        } else {
            emb.repeat_dim(1, self.cls_token_number)
        }
    }

    /// Positional rows `[1, len, C]` starting at absolute position `start`.
    fn positions(&self, start: usize, len: usize) -> Tensor<B, 3> {
        let [_, _, c] = self.pos_emb.dims();
        self.pos_emb.val().slice([0..1, start..(start + len), 0..c])
    }

    fn prepend(embeddings: Option<Tensor<B, 3>>, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match embeddings {
            Some(e) => Tensor::cat(vec![e, x], 1),
            None => x,
        }
    }

    /// Full-sequence embedding: `[B, n_prefix + cls + T, C]`.
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        labels: Tensor<B, 1, Int>,
        embeddings: Option<Tensor<B, 3>>,
        train: bool,
        force_drop: Option<Tensor<B, 1, Bool>>,
    ) -> Result<Tensor<B, 3>> {
        let tok = self.tok_emb.forward(tokens);
        let cls = self.class_tokens(labels, train, force_drop);
        let x = self.token_drop.forward(Tensor::cat(vec![cls, tok], 1));
        let x = Self::prepend(embeddings, x);

        let [_, t, _] = x.dims();
        if t > self.block_size {
            return Err(GptError::BlockSizeExceeded {
                requested: t,
                block_size: self.block_size,
            });
        }
        debug!("EmbeddingStage.forward: sequence length {}", t);

        Ok(self.drop.forward(x + self.positions(0, t)))
    }

    /// Embedding for one decoding step.
    ///
    /// `past_length == None` embeds a fresh span at positions `0..T`; otherwise
    /// the input must be a single position placed at `past_length`.
    pub fn forward_step(
        &self,
        input: StepInput<B>,
        embeddings: Option<Tensor<B, 3>>,
        past_length: Option<usize>,
    ) -> Result<Tensor<B, 3>> {
        let x = match input {
            StepInput::Labels(labels) => self.class_tokens(labels, false, None),
            StepInput::Tokens(ids) => self.tok_emb.forward(ids),
        };
        let x = Self::prepend(embeddings, x);
        let [_, t, _] = x.dims();

        let start = match past_length {
            Some(past) => {
                if t != 1 {
                    return Err(GptError::InvalidIncrementalInput(t));
                }
                past
            }
            None => 0,
        };
        if start + t > self.block_size {
            return Err(GptError::BlockSizeExceeded {
                requested: start + t,
                block_size: self.block_size,
            });
        }

        Ok(self.drop.forward(x + self.positions(start, t)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pretrained codebook loading
// ─────────────────────────────────────────────────────────────────────────────

/// Read a 2-D codebook table from a safetensors file as f32.
pub fn load_codebook<B: Backend>(
    path: impl AsRef<Path>,
    tensor_name: &str,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| GptError::Codebook(format!("failed to read {:?}: {}", path, e)))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| GptError::Codebook(format!("invalid safetensors {:?}: {}", path, e)))?;
    let view = tensors
        .tensor(tensor_name)
        .map_err(|e| GptError::Codebook(format!("{}: {}", tensor_name, e)))?;

    let shape = view.shape().to_vec();
    let &[rows, cols] = shape.as_slice() else {
        return Err(GptError::Codebook(format!(
            "{} must be 2-D, got shape {:?}",
            tensor_name, shape
        )));
    };

    let raw = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => raw
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => {
            return Err(GptError::Codebook(format!(
                "unsupported codebook dtype {:?}",
                other
            )));
        }
    };

    info!(
        "Loaded codebook {} [{}x{}] from {:?}",
        tensor_name, rows, cols, path
    );
    Ok(Tensor::<B, 2>::from_data(
        TensorData::new(values, [rows, cols]),
        device,
    ))
}

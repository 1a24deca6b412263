// src/gpt.rs

//! Class-conditional GPT over quantized image/video codes.
//!
//! Two entry points share the same weights:
//! - [`GptModel::forward`]: full-sequence forward for training, causal mask.
//! - [`GptModel::forward_with_past`]: one decoding step against a [`KvCache`],
//!   returning the step's stacked keys/values `[n_layer, 2, B, H, T, D]`.

use burn::{
    module::Module,
    nn::{LayerNorm, Linear},
    tensor::{Bool, Int, Tensor, backend::Backend},
};
use log::{debug, info};
use std::path::Path;

use crate::cache::KvCache;
use crate::causalattention::{AttentionMode, Block, causal_mask};
use crate::config::GptConfig;
use crate::embedding::{EmbeddingStage, StepInput};
use crate::error::Result;
use crate::init;

// ─────────────────────────────────────────────────────────────────────────────
// Output head
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    ln_f: LayerNorm<B>,
    head: Linear<B>,
}

impl<B: Backend> OutputHead<B> {
    pub fn new(cfg: &GptConfig, device: &B::Device) -> Self {
        Self {
            ln_f: init::layer_norm(cfg.n_embd, device),
            head: init::linear(cfg.n_embd, cfg.vocab_size, false, device),
        }
    }

    /// `[B, T, C] → [B, T, vocab_size]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.head.forward(self.ln_f.forward(x))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GPT
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct GptModel<B: Backend> {
    embed: EmbeddingStage<B>,
    blocks: Vec<Block<B>>,
    head: OutputHead<B>,
    /// Static visibility matrix shared by every layer, read only in fresh mode.
    mask: Tensor<B, 2, Bool>,
    n_head: usize,
    head_dim: usize,
    vocab_size: usize,
}

impl<B: Backend> GptModel<B> {
    pub fn new(cfg: &GptConfig, device: &B::Device) -> Result<Self> {
        cfg.validate()?;

        info!("═══════════════════════════════════════");
        info!("Initializing GptModel");
        info!("  vocab_size: {}", cfg.vocab_size);
        info!("  block_size: {}", cfg.block_size);
        info!("  n_layer: {}", cfg.n_layer);
        info!("  n_head: {}", cfg.n_head);
        info!("  n_embd: {}", cfg.n_embd);
        info!("  num_classes: {}", cfg.num_classes);
        info!("  cls_token_number: {}", cfg.cls_token_number);
        info!("═══════════════════════════════════════");

        let embed = EmbeddingStage::new(cfg, device);

        info!("Creating {} transformer blocks", cfg.n_layer);
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::new(cfg, i, device))
            .collect();

        let model = Self {
            embed,
            blocks,
            head: OutputHead::new(cfg, device),
            mask: causal_mask(cfg.block_size, cfg.n_unmasked, device),
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
            vocab_size: cfg.vocab_size,
        };
        info!("number of parameters: {:e}", model.num_params() as f64);
        Ok(model)
    }

    /// Build a model whose token table is a frozen pretrained codebook.
    pub fn with_pretrained_codebook(
        cfg: &GptConfig,
        codebook: Tensor<B, 2>,
        device: &B::Device,
    ) -> Result<Self> {
        let mut model = Self::new(cfg, device)?;
        model.embed = model.embed.with_codebook(codebook)?;
        Ok(model)
    }

    /// Same as [`Self::with_pretrained_codebook`], reading the table from a safetensors file.
    pub fn from_codebook_file(
        cfg: &GptConfig,
        path: impl AsRef<Path>,
        tensor_name: &str,
        device: &B::Device,
    ) -> Result<Self> {
        let codebook = crate::embedding::load_codebook::<B>(path, tensor_name, device)?;
        Self::with_pretrained_codebook(cfg, codebook, device)
    }

    pub fn embedding(&self) -> &EmbeddingStage<B> {
        &self.embed
    }

    #[cfg(test)]
    pub(crate) fn with_random_positions(mut self) -> Self {
        self.embed = self.embed.randomize_positions();
        self
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn n_head(&self) -> usize {
        self.n_head
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn block_size(&self) -> usize {
        self.embed.block_size()
    }

    pub fn cls_token_number(&self) -> usize {
        self.embed.cls_token_number()
    }

    pub fn null_class(&self) -> usize {
        self.embed.label_embedder().null_class()
    }

    /// Expected cache shape for a batch of `batch` rows holding `past_length` positions.
    pub fn cache_shape(&self, batch: usize, past_length: usize) -> [usize; 6] {
        [
            self.num_layers(),
            2,
            batch,
            self.n_head,
            past_length,
            self.head_dim,
        ]
    }

    /// Training forward: `[B, T]` codes + `[B]` labels → `[B, n_prefix + cls + T, vocab]`.
    ///
    /// Label dropout is active when the backend tracks gradients, or when
    /// `force_drop` is given.
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        labels: Tensor<B, 1, Int>,
        embeddings: Option<Tensor<B, 3>>,
        force_drop: Option<Tensor<B, 1, Bool>>,
    ) -> Result<Tensor<B, 3>> {
        let [b, t] = tokens.dims();
        debug!("GptModel.forward: input [B={}, T={}]", b, t);

        let mut x = self
            .embed
            .forward(tokens, labels, embeddings, B::ad_enabled(), force_drop)?;
        debug!("After embedding: shape {:?}", x.dims());

        for (i, block) in self.blocks.iter().enumerate() {
            let (y, _) = block.forward(x, AttentionMode::NoCache { mask: &self.mask });
            x = y;
            debug!("After block {}: shape {:?}", i, x.dims());
        }

        let logits = self.head.forward(x);
        debug!("Final logits shape: {:?}", logits.dims());
        Ok(logits)
    }

    /// One decoding step.
    ///
    /// Without a cache (or with an empty one and `past_length == 0`) the input
    /// span is processed fresh at positions `0..T`. With a cache, the cache must
    /// have exactly the shape `[n_layer, 2, B, n_head, past_length, head_dim]`
    /// and the input must be one position, placed at `past_length`.
    ///
    /// Returns `[B, T, vocab]` logits and this step's stacked keys/values.
    pub fn forward_with_past(
        &self,
        input: StepInput<B>,
        embeddings: Option<Tensor<B, 3>>,
        past: Option<&KvCache<B>>,
        past_length: usize,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 6>)> {
        let batch = input.batch();
        let past = match past {
            Some(cache) if cache.is_empty() && past_length == 0 => None,
            Some(cache) => {
                cache.check_shape(self.cache_shape(batch, past_length))?;
                Some(cache)
            }
            None => None,
        };

        let mut x = self
            .embed
            .forward_step(input, embeddings, past.map(|_| past_length))?;
        debug!(
            "GptModel.forward_with_past: x {:?}, past_length={}",
            x.dims(),
            past_length
        );

        let mut presents = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let mode = match past.and_then(|cache| cache.layer(i)) {
                Some(layer_past) => AttentionMode::WithCache { past: layer_past },
                None => AttentionMode::NoCache { mask: &self.mask },
            };
            let (y, (k, v)) = block.forward(x, mode);
            x = y;
            presents.push(Tensor::stack::<5>(vec![k, v], 0));
        }

        let logits = self.head.forward(x);
        let present: Tensor<B, 6> = Tensor::stack(presents, 0);
        debug!("Step present shape: {:?}", present.dims());
        Ok((logits, present))
    }

    pub fn check_logits_health(logits: &Tensor<B, 3>) -> bool {
        let vec: Vec<f32> = logits.clone().to_data().to_vec().unwrap_or_default();
        let is_healthy = !vec.is_empty() && vec.iter().all(|&x| x.is_finite());
        if !is_healthy {
            debug!("Logits contain NaN or Inf");
        }
        is_healthy
    }

    /// Save this model and its config to a checkpoint directory
    pub fn save_checkpoint(
        &self,
        config: &GptConfig,
        checkpoint_dir: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        crate::checkpoint::save_checkpoint(self, config, checkpoint_dir)
    }

    /// Load a model from checkpoint directory
    pub fn load_checkpoint(
        checkpoint_dir: impl AsRef<Path>,
        device: &B::Device,
    ) -> anyhow::Result<(Self, GptConfig)> {
        crate::checkpoint::load_checkpoint(checkpoint_dir, device)
    }
}

//! Causal self-attention transformer block with a dual execution mode.
//!
//! - `AttentionMode::NoCache`: full `[T, T]` attention under the static
//!   lower-triangular mask (training / prefill).
//! - `AttentionMode::WithCache`: exactly one new position; its key/value is
//!   appended to the cached span and the query attends to all of it. The new
//!   query is always the most recent position, so no mask is needed.
//!
//! Both modes return this call's keys/values (`[B, H, T, D]`) so the caller
//! can extend its cache.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, LayerNorm, Linear},
    tensor::{Bool, Tensor, TensorData, activation, backend::Backend},
};
use log::{debug, info, trace};

use crate::config::GptConfig;
use crate::init;

/// Keys and values of one layer, each `[B, H, T, D]`.
pub type LayerKv<B> = (Tensor<B, 4>, Tensor<B, 4>);

#[derive(Debug, Clone)]
pub enum AttentionMode<'a, B: Backend> {
    /// Static causal mask `[block_size, block_size]`, true = blocked.
    NoCache { mask: &'a Tensor<B, 2, Bool> },
    /// Cached keys/values `[B, H, T_past, D]` for this layer.
    WithCache { past: LayerKv<B> },
}

/// Blocked positions of the causal mask (`true` = not visible): everything above
/// the diagonal, except inside the leading `n_unmasked` square.
pub fn causal_mask<B: Backend>(
    block_size: usize,
    n_unmasked: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let blocked: Vec<bool> = (0..block_size * block_size)
        .map(|idx| {
            let (i, j) = (idx / block_size, idx % block_size);
            j > i && !(i < n_unmasked && j < n_unmasked)
        })
        .collect();
    Tensor::<B, 2, Bool>::from_data(TensorData::new(blocked, [block_size, block_size]), device)
}

// ─────────────────────────────────────────────────────────────────────────────
// Attention
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct CausalSelfAttention<B: Backend> {
    layer_idx: usize,
    n_head: usize,
    head_dim: usize,
    key: Linear<B>,
    query: Linear<B>,
    value: Linear<B>,
    proj: Linear<B>,
    attn_drop: Dropout,
    resid_drop: Dropout,
}

impl<B: Backend> CausalSelfAttention<B> {
    pub fn new(cfg: &GptConfig, layer_idx: usize, device: &B::Device) -> Self {
        let n_embd = cfg.n_embd;
        let n_head = cfg.n_head;
        assert_eq!(n_embd % n_head, 0, "n_embd must be divisible by n_head");
        let head_dim = n_embd / n_head;

        debug!(
            "Layer {}: Attn n_head={}, head_dim={}",
            layer_idx, n_head, head_dim
        );

        Self {
            layer_idx,
            n_head,
            head_dim,
            key: init::linear(n_embd, n_embd, true, device),
            query: init::linear(n_embd, n_embd, true, device),
            value: init::linear(n_embd, n_embd, true, device),
            proj: init::linear(n_embd, n_embd, true, device),
            attn_drop: DropoutConfig::new(cfg.attn_pdrop).init(),
            resid_drop: DropoutConfig::new(cfg.resid_pdrop).init(),
        }
    }

    /// `[B, T, C] → [B, H, T, D]`
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [b, t, _] = x.dims();
        x.reshape([b, t, self.n_head, self.head_dim]).swap_dims(1, 2)
    }

    pub fn forward(&self, x: Tensor<B, 3>, mode: AttentionMode<'_, B>) -> (Tensor<B, 3>, LayerKv<B>) {
        let [b, t, c] = x.dims();
        debug!(
            "Layer {} attn forward: input [B={}, T={}, C={}]",
            self.layer_idx, b, t, c
        );

        let k = self.split_heads(self.key.forward(x.clone()));
        let q = self.split_heads(self.query.forward(x.clone()));
        let v = self.split_heads(self.value.forward(x));
        let present = (k.clone(), v.clone());

        let scale = 1.0 / (self.head_dim as f64).sqrt();

        let (att, v) = match mode {
            AttentionMode::NoCache { mask } => {
                let att = q.matmul(k.swap_dims(2, 3)).mul_scalar(scale); // [B, H, T, T]
                let blocked = mask
                    .clone()
                    .slice([0..t, 0..t])
                    .unsqueeze_dims::<4>(&[0, 1])
                    .expand([b, self.n_head, t, t]);
                trace!("Attn(L{}): causal mask applied over T={}", self.layer_idx, t);
                (att.mask_fill(blocked, f32::NEG_INFINITY), v)
            }
            AttentionMode::WithCache {
                past: (past_k, past_v),
            } => {
                debug_assert_eq!(t, 1, "incremental attention expects T=1 input");
                let t_past = past_k.dims()[2];
                let k_all = Tensor::cat(vec![past_k, k], 2);
                let v_all = Tensor::cat(vec![past_v, v], 2);
                trace!(
                    "Attn(L{}): attending over cached T={} + 1",
                    self.layer_idx, t_past
                );
                (q.matmul(k_all.swap_dims(2, 3)).mul_scalar(scale), v_all) // [B, H, 1, T_past + 1]
            }
        };

        let att = activation::softmax(att, 3);
        let att = self.attn_drop.forward(att);
        let y = att.matmul(v); // [B, H, T, D]

        let y = y.swap_dims(1, 2).reshape([b, t, c]);
        let y = self.resid_drop.forward(self.proj.forward(y));
        (y, present)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MLP (GELU) and Block (pre-norm)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    c_fc: Linear<B>,
    c_proj: Linear<B>,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn new(cfg: &GptConfig, device: &B::Device) -> Self {
        let n = cfg.n_embd;
        debug!("MLP init: n_embd={}, hidden=4*n_embd={}", n, 4 * n);
        Self {
            c_fc: init::linear(n, 4 * n, true, device),
            c_proj: init::linear(4 * n, n, true, device),
            drop: DropoutConfig::new(cfg.resid_pdrop).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = activation::gelu(self.c_fc.forward(x));
        self.drop.forward(self.c_proj.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    layer_idx: usize,
    ln1: LayerNorm<B>,
    attn: CausalSelfAttention<B>,
    ln2: LayerNorm<B>,
    mlp: Mlp<B>,
}

impl<B: Backend> Block<B> {
    pub fn new(cfg: &GptConfig, layer_idx: usize, device: &B::Device) -> Self {
        info!("Initializing Block {}", layer_idx);
        Self {
            layer_idx,
            ln1: init::layer_norm(cfg.n_embd, device),
            attn: CausalSelfAttention::new(cfg, layer_idx, device),
            ln2: init::layer_norm(cfg.n_embd, device),
            mlp: Mlp::new(cfg, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mode: AttentionMode<'_, B>) -> (Tensor<B, 3>, LayerKv<B>) {
        let (attn, present) = self.attn.forward(self.ln1.forward(x.clone()), mode);
        let x = x + attn;
        let x = x.clone() + self.mlp.forward(self.ln2.forward(x));
        trace!("Block {} output {:?}", self.layer_idx, x.dims());
        (x, present)
    }
}

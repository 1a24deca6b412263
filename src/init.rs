// src/init.rs

//! Parameter initialization, applied once per parameter group at construction.
//!
//! - linear / embedding weights: N(0, 0.02)
//! - linear biases: 0
//! - layer norms: weight 1, bias 0
//! - learned positional table: 0

use burn::{
    module::Param,
    nn::{
        Embedding, EmbeddingConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{Tensor, backend::Backend},
};

pub const INIT_STD: f64 = 0.02;

fn normal() -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: INIT_STD,
    }
}

pub fn linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: bool,
    device: &B::Device,
) -> Linear<B> {
    let mut layer = LinearConfig::new(d_input, d_output)
        .with_bias(bias)
        .with_initializer(normal())
        .init(device);
    if bias {
        layer.bias = Some(Initializer::Zeros.init([d_output], device));
    }
    layer
}

pub fn embedding<B: Backend>(n_embedding: usize, d_model: usize, device: &B::Device) -> Embedding<B> {
    EmbeddingConfig::new(n_embedding, d_model)
        .with_initializer(normal())
        .init(device)
}

/// Embedding table with fixed, externally supplied rows. Excluded from training.
pub fn frozen_embedding<B: Backend>(table: Tensor<B, 2>) -> Embedding<B> {
    let [n_embedding, d_model] = table.dims();
    let mut layer = EmbeddingConfig::new(n_embedding, d_model)
        .with_initializer(Initializer::Zeros)
        .init(&table.device());
    layer.weight = Param::from_tensor(table).set_require_grad(false);
    layer
}

pub fn layer_norm<B: Backend>(d_model: usize, device: &B::Device) -> LayerNorm<B> {
    LayerNormConfig::new(d_model).init(device)
}

pub fn positional<B: Backend>(
    block_size: usize,
    d_model: usize,
    device: &B::Device,
) -> Param<Tensor<B, 3>> {
    Initializer::Zeros.init([1, block_size, d_model], device)
}

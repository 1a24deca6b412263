// src/cache.rs

//! Stacked key/value cache for incremental decoding.
//!
//! Layout: `[n_layer, 2 (key, value), B, n_head, T_past, head_dim]`.
//! One cache belongs to one generation run; it grows by the span returned
//! from each step and is dropped when the run ends.

use burn::tensor::{Tensor, backend::Backend};
use log::debug;

use crate::error::{GptError, Result};

/// Time axis of the stacked layout.
pub const TIME_DIM: usize = 4;

#[derive(Debug, Clone)]
pub struct KvCache<B: Backend> {
    past: Option<Tensor<B, 6>>,
}

impl<B: Backend> Default for KvCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> KvCache<B> {
    pub fn new() -> Self {
        Self { past: None }
    }

    /// Wrap an already stacked `[n_layer, 2, B, H, T, D]` tensor.
    pub fn from_tensor(past: Tensor<B, 6>) -> Self {
        Self { past: Some(past) }
    }

    pub fn is_empty(&self) -> bool {
        self.past.is_none()
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.past.as_ref().map_or(0, |p| p.dims()[TIME_DIM])
    }

    /// Shape of the stacked tensor; all zeros when nothing is cached.
    pub fn dims(&self) -> [usize; 6] {
        self.past.as_ref().map_or([0; 6], |p| p.dims())
    }

    pub fn tensor(&self) -> Option<&Tensor<B, 6>> {
        self.past.as_ref()
    }

    /// Append the per-layer keys/values produced by one step (time-axis concat).
    pub fn append(&mut self, present: Tensor<B, 6>) {
        let t_new = present.dims()[TIME_DIM];
        self.past = Some(match self.past.take() {
            Some(past) => {
                let t_prev = past.dims()[TIME_DIM];
                debug!("KvCache: append T {} -> {}", t_prev, t_prev + t_new);
                Tensor::cat(vec![past, present], TIME_DIM)
            }
            None => {
                debug!("KvCache: initialized with T={}", t_new);
                present
            }
        });
    }

    /// Check the cache against `expected` before it is read.
    pub fn check_shape(&self, expected: [usize; 6]) -> Result<()> {
        let actual = self.dims();
        if actual != expected {
            return Err(GptError::CacheShapeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Keys and values of one layer, each `[B, H, T_past, D]`.
    pub fn layer(&self, layer_idx: usize) -> Option<(Tensor<B, 4>, Tensor<B, 4>)> {
        let past = self.past.as_ref()?;
        let [_, _, b, h, t, d] = past.dims();
        let kv = past
            .clone()
            .slice([layer_idx..layer_idx + 1, 0..2, 0..b, 0..h, 0..t, 0..d])
            .reshape([2, b, h, t, d]);
        let k = kv.clone().slice([0..1, 0..b, 0..h, 0..t, 0..d]).reshape([b, h, t, d]);
        let v = kv.slice([1..2, 0..b, 0..h, 0..t, 0..d]).reshape([b, h, t, d]);
        Some((k, v))
    }

    pub fn clear(&mut self) {
        self.past = None;
    }
}

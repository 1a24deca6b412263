// src/sampling.rs

//! Logits post-processing for decoding: guidance, temperature, top-k / top-p
//! filtering, and token selection.
//!
//! All selection functions take `[B, V]` and return `[B, 1]` Int tensors.

use burn::tensor::{Bool, Int, Tensor, TensorData, activation, backend::Backend};
use log::{debug, trace};
use rand::Rng;

use crate::error::{GptError, Result};

// ═════════════════════════════════════════════════════════════════════════════
// Classifier-free guidance
// ═════════════════════════════════════════════════════════════════════════════

/// Recombine a `[conditional; unconditional]` batch along dim 0:
/// `uncond + (cond - uncond) * scale`. The output has half the rows.
pub fn apply_guidance<B: Backend, const D: usize>(logits: Tensor<B, D>, scale: f64) -> Tensor<B, D> {
    let rows = logits.dims()[0];
    debug_assert_eq!(rows % 2, 0, "guidance expects an even batch");
    let half = rows / 2;
    let cond = logits.clone().narrow(0, 0, half);
    let uncond = logits.narrow(0, half, half);
    trace!("Guidance: scale={} over {} rows", scale, half);
    uncond.clone() + (cond - uncond).mul_scalar(scale)
}

// ═════════════════════════════════════════════════════════════════════════════
// Temperature scaling
// ═════════════════════════════════════════════════════════════════════════════

pub fn apply_temperature<B: Backend>(logits: Tensor<B, 2>, temperature: f64) -> Result<Tensor<B, 2>> {
    if temperature <= 0.0 || !temperature.is_finite() {
        return Err(GptError::InvalidTemperature(temperature));
    }
    if temperature == 1.0 {
        return Ok(logits);
    }
    debug!("Applying temperature scaling: {}", temperature);
    Ok(logits.div_scalar(temperature))
}

// ═════════════════════════════════════════════════════════════════════════════
// Top-k filtering
// ═════════════════════════════════════════════════════════════════════════════

/// Keep every logit >= the k-th largest of its row (ties kept); `k` is
/// clamped to `[1, vocab]`, so at least one entry survives.
pub fn top_k_filter<B: Backend>(logits: Tensor<B, 2>, k: usize) -> Tensor<B, 2> {
    let [batch, vocab] = logits.dims();
    let k = k.clamp(1, vocab);
    if k == vocab {
        return logits;
    }

    // CPU pass: compute kth-largest threshold per row.
    let host: Vec<f32> = logits.to_data().to_vec().unwrap_or_default();
    let mut keep_mask = vec![false; batch * vocab];

    for (row, keep) in host.chunks_exact(vocab).zip(keep_mask.chunks_exact_mut(vocab)) {
        let mut sorted = row.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let kth_val = sorted[k - 1];
        for (flag, &v) in keep.iter_mut().zip(row.iter()) {
            *flag = v >= kth_val;
        }
    }

    let keep = Tensor::<B, 2, Bool>::from_data(
        TensorData::new(keep_mask, [batch, vocab]),
        &logits.device(),
    );
    logits.mask_fill(keep.bool_not(), f32::NEG_INFINITY)
}

// ═════════════════════════════════════════════════════════════════════════════
// Top-p (nucleus) filtering
// ═════════════════════════════════════════════════════════════════════════════

/// Keep the smallest highest-probability prefix whose cumulative mass reaches
/// `p`. The most probable token of each row is always kept.
pub fn top_p_filter<B: Backend>(logits: Tensor<B, 2>, p: f64) -> Tensor<B, 2> {
    let [batch, vocab] = logits.dims();
    if p >= 1.0 {
        return logits;
    }
    debug!("Applying top-p filter: p={}", p);

    let probs = activation::softmax(logits.clone(), 1);
    let probs_host: Vec<f32> = probs.to_data().to_vec().unwrap_or_default();
    let mut keep_mask = vec![false; batch * vocab];

    for (row, keep) in probs_host
        .chunks_exact(vocab)
        .zip(keep_mask.chunks_exact_mut(vocab))
    {
        let mut order: Vec<usize> = (0..vocab).collect();
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

        let mut cum = 0.0f64;
        for (rank, idx) in order.into_iter().enumerate() {
            if rank > 0 && cum >= p {
                break;
            }
            keep[idx] = true;
            cum += row[idx] as f64;
        }
    }

    let keep = Tensor::<B, 2, Bool>::from_data(
        TensorData::new(keep_mask, [batch, vocab]),
        &logits.device(),
    );
    logits.mask_fill(keep.bool_not(), f32::NEG_INFINITY)
}

/// Top-k then nucleus filtering. At least one of the two must be set.
pub fn top_k_top_p_filter<B: Backend>(
    logits: Tensor<B, 2>,
    top_k: Option<usize>,
    top_p: Option<f64>,
) -> Result<Tensor<B, 2>> {
    check_filters(top_k, top_p)?;
    let logits = match top_k {
        Some(k) => top_k_filter(logits, k),
        None => logits,
    };
    Ok(match top_p {
        Some(p) => top_p_filter(logits, p),
        None => logits,
    })
}

pub fn check_filters(top_k: Option<usize>, top_p: Option<f64>) -> Result<()> {
    match (top_k, top_p) {
        (None, None) => Err(GptError::NoFilter),
        (Some(0), _) => Err(GptError::InvalidTopK(0)),
        (_, Some(p)) if !(p > 0.0 && p <= 1.0) => Err(GptError::InvalidTopP(p)),
        _ => Ok(()),
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Token selection
// ═════════════════════════════════════════════════════════════════════════════

/// Greedy selection: argmax on the vocab dimension. `[B, V] → [B, 1]`
pub fn sample_greedy<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 2, Int> {
    logits.argmax(1)
}

fn sample_multinomial_row<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r: f32 = rng.r#gen();
    let mut cum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cum += p;
        if r < cum {
            return i;
        }
    }
    // Rounding left r above the total mass: take the last entry with mass.
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

/// One categorical draw per row of `probs`. `[B, V] → [B, 1]`
pub fn sample_from_probs<B: Backend, R: Rng + ?Sized>(
    probs: Tensor<B, 2>,
    rng: &mut R,
) -> Tensor<B, 2, Int> {
    let [b, v] = probs.dims();
    let host: Vec<f32> = probs.to_data().to_vec().unwrap_or_default();

    let out: Vec<i64> = host
        .chunks_exact(v)
        .map(|row| sample_multinomial_row(row, rng) as i64)
        .collect();

    Tensor::<B, 1, Int>::from_data(TensorData::new(out, [b]), &probs.device()).reshape([b, 1])
}

/// Softmax over filtered logits, then argmax (`sample == false`) or a draw.
pub fn select_next<B: Backend, R: Rng + ?Sized>(
    filtered_logits: Tensor<B, 2>,
    sample: bool,
    rng: &mut R,
) -> Tensor<B, 2, Int> {
    let probs = activation::softmax(filtered_logits, 1);
    if sample {
        sample_from_probs(probs, rng)
    } else {
        sample_greedy(probs)
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Utility functions
// ═════════════════════════════════════════════════════════════════════════════

/// Extract last timestep logits from [B, T, V] -> [B, V]
pub fn extract_last_logits<B: Backend>(logits: Tensor<B, 3>) -> Tensor<B, 2> {
    let [b, t, v] = logits.dims();
    logits.slice([0..b, (t - 1)..t, 0..v]).reshape([b, v])
}

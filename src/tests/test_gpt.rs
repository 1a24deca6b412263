//! Tests for the class-conditional GPT.
//!
//! Tests cover:
//! - Forward shapes with and without prepended embeddings
//! - Causality of the fresh forward, and the unmasked leading square
//! - Label dropout (forced and probabilistic)
//! - Block size enforcement
//! - Training backend forward/backward

use burn::module::Module;
use burn::prelude::Backend;
use burn::tensor::{Bool, Int, Tensor, TensorData};

use crate::backend::{AutoBackend, TrainBackend};
use crate::causalattention::causal_mask;
use crate::config::GptConfig;
use crate::error::GptError;
use crate::gpt::GptModel;

type TestBackend = AutoBackend;

// ─────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────

fn test_config() -> GptConfig {
    GptConfig {
        vocab_size: 64,
        block_size: 16,
        n_layer: 2,
        n_head: 2,
        n_embd: 32,
        num_classes: 10,
        label_dropout: 0.0,
        ..GptConfig::default()
    }
}

fn tokens(rows: &[&[i64]], device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2, Int> {
    let t = rows[0].len();
    let flat: Vec<i64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::<TestBackend, 1, Int>::from_ints(flat.as_slice(), device).reshape([rows.len(), t])
}

fn labels(values: &[i64], device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 1, Int> {
    Tensor::<TestBackend, 1, Int>::from_ints(values, device)
}

/// Logits at sequence position `pos` as a flat vec.
fn position(logits: &Tensor<TestBackend, 3>, pos: usize) -> Vec<f32> {
    let [b, _, v] = logits.dims();
    logits
        .clone()
        .slice([0..b, pos..pos + 1, 0..v])
        .to_data()
        .to_vec()
        .unwrap()
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}

// ─────────────────────────────────────────────────────────────────────────
// Shapes
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_forward_shape() {
    crate::init();
    let cfg = test_config();
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    let ids = tokens(&[&[1, 2, 3, 4, 5], &[6, 7, 8, 9, 10]], &device);
    let logits = model.forward(ids, labels(&[0, 3], &device), None, None).unwrap();

    assert_eq!(logits.dims(), [2, 1 + 5, cfg.vocab_size]);
    assert!(GptModel::check_logits_health(&logits));
}

#[test]
fn test_forward_shape_multiple_class_tokens_and_prefix() {
    let cfg = GptConfig {
        cls_token_number: 3,
        ..test_config()
    };
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    let prefix = Tensor::<TestBackend, 3>::ones([1, 2, cfg.n_embd], &device);
    let ids = tokens(&[&[1, 2, 3, 4]], &device);
    let logits = model
        .forward(ids, labels(&[5], &device), Some(prefix), None)
        .unwrap();

    assert_eq!(logits.dims(), [1, 2 + 3 + 4, cfg.vocab_size]);
}

#[test]
fn test_model_accessors() {
    let cfg = test_config();
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    assert_eq!(model.num_layers(), 2);
    assert_eq!(model.n_head(), 2);
    assert_eq!(model.head_dim(), 16);
    assert_eq!(model.vocab_size(), 64);
    assert_eq!(model.block_size(), 16);
    assert_eq!(model.null_class(), 10);
    assert_eq!(model.cache_shape(3, 5), [2, 2, 3, 2, 5, 16]);
    assert!(model.num_params() > 0);
}

#[test]
fn test_invalid_config_rejected() {
    let cfg = GptConfig {
        n_embd: 30,
        n_head: 4,
        ..test_config()
    };
    let device = Default::default();
    let result = GptModel::<TestBackend>::new(&cfg, &device);
    assert!(matches!(result, Err(GptError::Config(_))));
}

// ─────────────────────────────────────────────────────────────────────────
// Causality
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_causal_mask_blocks_future_outside_unmasked_square() {
    let device = Default::default();
    let blocked: Vec<bool> = causal_mask::<TestBackend>(4, 2, &device)
        .to_data()
        .to_vec()
        .unwrap();
    #[rustfmt::skip]
    let expected = vec![
        false, false, true,  true,
        false, false, true,  true,
        false, false, false, true,
        false, false, false, false,
    ];
    assert_eq!(blocked, expected);

    let plain: Vec<bool> = causal_mask::<TestBackend>(3, 0, &device)
        .to_data()
        .to_vec()
        .unwrap();
    assert_eq!(plain, vec![false, true, true, false, false, true, false, false, false]);
}

#[test]
fn test_future_tokens_do_not_affect_past_logits() {
    let cfg = test_config();
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    let a = tokens(&[&[1, 2, 3, 4, 5, 6]], &device);
    let b = tokens(&[&[1, 2, 3, 40, 50, 60]], &device);
    let la = model.forward(a, labels(&[2], &device), None, None).unwrap();
    let lb = model.forward(b, labels(&[2], &device), None, None).unwrap();

    // Sequence positions 0..=3 see the class token and codes 0..=2 only.
    for pos in 0..=3 {
        let diff = max_abs_diff(&position(&la, pos), &position(&lb, pos));
        assert!(diff < 1e-6, "position {} changed by {}", pos, diff);
    }
    let diff = max_abs_diff(&position(&la, 4), &position(&lb, 4));
    assert!(diff > 0.0, "position 4 must see the changed code");
}

#[test]
fn test_unmasked_prefix_is_bidirectional() {
    let cfg = GptConfig {
        n_unmasked: 3,
        ..test_config()
    };
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    // Code index 1 sits at sequence position 2, inside the unmasked square.
    let a = tokens(&[&[1, 2, 3, 4]], &device);
    let b = tokens(&[&[1, 30, 3, 4]], &device);
    let la = model.forward(a, labels(&[2], &device), None, None).unwrap();
    let lb = model.forward(b, labels(&[2], &device), None, None).unwrap();

    let diff = max_abs_diff(&position(&la, 0), &position(&lb, 0));
    assert!(diff > 0.0, "unmasked square must be visible from position 0");

    // Code index 2 sits at sequence position 3, outside the square.
    let c = tokens(&[&[1, 2, 33, 4]], &device);
    let lc = model.forward(c, labels(&[2], &device), None, None).unwrap();
    for pos in 0..=2 {
        let diff = max_abs_diff(&position(&la, pos), &position(&lc, pos));
        assert!(diff < 1e-6, "position {} changed by {}", pos, diff);
    }
}

#[test]
fn test_batch_rows_are_independent() {
    let cfg = test_config();
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    let single = model
        .forward(tokens(&[&[1, 2, 3]], &device), labels(&[4], &device), None, None)
        .unwrap();
    let batched = model
        .forward(
            tokens(&[&[1, 2, 3], &[9, 8, 7]], &device),
            labels(&[4, 1], &device),
            None,
            None,
        )
        .unwrap();

    let [_, t, v] = batched.dims();
    let first: Vec<f32> = batched.slice([0..1, 0..t, 0..v]).to_data().to_vec().unwrap();
    let single: Vec<f32> = single.to_data().to_vec().unwrap();
    assert!(max_abs_diff(&first, &single) < 1e-5);
}

// ─────────────────────────────────────────────────────────────────────────
// Label dropout
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_forced_label_drop_uses_null_class() {
    let cfg = test_config();
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();
    let null = cfg.null_class() as i64;

    let ids = tokens(&[&[1, 2, 3], &[1, 2, 3]], &device);
    let force = Tensor::<TestBackend, 1, Bool>::from_data(TensorData::from([true, false]), &device);
    let dropped = model
        .forward(ids.clone(), labels(&[3, 5], &device), None, Some(force))
        .unwrap();
    let reference = model
        .forward(ids, labels(&[null, 5], &device), None, None)
        .unwrap();

    let a: Vec<f32> = dropped.to_data().to_vec().unwrap();
    let b: Vec<f32> = reference.to_data().to_vec().unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-6);
}

#[test]
fn test_label_dropout_inactive_without_autodiff() {
    let cfg = GptConfig {
        label_dropout: 1.0,
        ..test_config()
    };
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    let ids = tokens(&[&[1, 2, 3]], &device);
    let a = model.forward(ids.clone(), labels(&[3], &device), None, None).unwrap();
    let b = model
        .forward(ids, labels(&[cfg.null_class() as i64], &device), None, None)
        .unwrap();

    let a: Vec<f32> = a.to_data().to_vec().unwrap();
    let b: Vec<f32> = b.to_data().to_vec().unwrap();
    assert!(max_abs_diff(&a, &b) > 0.0, "inference must keep the real label");
}

// ─────────────────────────────────────────────────────────────────────────
// Block size
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_forward_rejects_sequences_over_block_size() {
    let cfg = GptConfig {
        block_size: 8,
        ..test_config()
    };
    let device = Default::default();
    let model = GptModel::<TestBackend>::new(&cfg, &device).unwrap();

    // 1 class token + 7 codes fits exactly.
    let ok = model.forward(tokens(&[&[1; 7]], &device), labels(&[0], &device), None, None);
    assert!(ok.is_ok());

    let err = model
        .forward(tokens(&[&[1; 8]], &device), labels(&[0], &device), None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        GptError::BlockSizeExceeded {
            requested: 9,
            block_size: 8
        }
    ));
}

// ─────────────────────────────────────────────────────────────────────────
// Training backend
// ─────────────────────────────────────────────────────────────────────────

#[test]
fn test_training_forward_backward() {
    let cfg = GptConfig {
        embd_pdrop: 0.1,
        resid_pdrop: 0.1,
        attn_pdrop: 0.1,
        label_dropout: 0.5,
        ..test_config()
    };
    let device = Default::default();
    let model = GptModel::<TrainBackend>::new(&cfg, &device).unwrap();

    let ids = Tensor::<TrainBackend, 1, Int>::from_ints([1, 2, 3, 4].as_slice(), &device)
        .reshape([1, 4]);
    let labels = Tensor::<TrainBackend, 1, Int>::from_ints([7].as_slice(), &device);
    let logits = model.forward(ids, labels, None, None).unwrap();
    assert_eq!(logits.dims(), [1, 5, cfg.vocab_size]);

    let grads = logits.mean().backward();
    let table = model.embedding().token_embedding().table_weight();
    assert!(table.grad(&grads).is_some());
}

// src/engine.rs

//! Cached autoregressive sampling loop.
//!
//! ```text
//! INIT ──▶ STEP(0) ──▶ STEP(1) ──▶ … ──▶ STEP(steps-1) ──▶ DONE
//! ```
//!
//! `STEP(0)` feeds the class-token prefix (plus any prepended embeddings) fresh;
//! every later step feeds the previously chosen code as a single position
//! against the running [`KvCache`]. The cache lives in the [`Streamer`] and is
//! dropped with it.

use burn::tensor::{Int, Tensor, backend::Backend};
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng};

use crate::cache::KvCache;
use crate::embedding::StepInput;
use crate::error::{GptError, Result};
use crate::gpt::GptModel;
use crate::sampling::{
    apply_guidance, apply_temperature, check_filters, extract_last_logits, select_next,
    top_k_top_p_filter,
};

/// Decoding parameters for one generation run.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleConfig {
    pub steps: usize,
    pub temperature: f64,
    /// Classifier-free guidance strength; active only when > 1.0.
    pub guidance_scale: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// `false` selects the argmax of the filtered distribution.
    pub sample_logits: bool,
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            steps: 256,
            temperature: 1.0,
            guidance_scale: 1.0,
            top_k: None,
            top_p: Some(1.0),
            sample_logits: true,
            seed: 0,
        }
    }
}

impl SampleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.temperature <= 0.0 || !self.temperature.is_finite() {
            return Err(GptError::InvalidTemperature(self.temperature));
        }
        if self.guidance_scale < 0.0 || !self.guidance_scale.is_finite() {
            return Err(GptError::InvalidGuidanceScale(self.guidance_scale));
        }
        check_filters(self.top_k, self.top_p)
    }

    pub fn guided(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

pub struct Engine<B: Backend> {
    pub model: GptModel<B>,
    device: B::Device,
}

impl<B: Backend> Engine<B> {
    pub fn new(model: GptModel<B>, device: B::Device) -> Self {
        info!("Engine: new with {} layers", model.num_layers());
        Self { model, device }
    }

    /// Start a generation run. Validation happens here, before any forward.
    ///
    /// `labels` are the conditional class labels `[B]`. With guidance the engine
    /// appends the unconditional half itself. `embeddings` (`[B, n, C]`) are
    /// prepended to the class tokens on the first step.
    pub fn stream(
        &self,
        labels: Tensor<B, 1, Int>,
        embeddings: Option<Tensor<B, 3>>,
        config: &SampleConfig,
    ) -> Result<Streamer<'_, B>> {
        config.validate()?;

        let [batch] = labels.dims();
        if batch == 0 {
            return Err(GptError::EmptyConditioning);
        }

        let prefix = embeddings.as_ref().map_or(0, |e| e.dims()[1]);
        let cond_len = prefix + self.model.cls_token_number();
        let block_size = self.model.block_size();
        if cond_len + config.steps > block_size {
            return Err(GptError::BlockSizeExceeded {
                requested: cond_len + config.steps,
                block_size,
            });
        }

        let guided = config.guided();
        let (labels, embeddings) = if guided {
            let null = Tensor::<B, 1, Int>::full([batch], self.model.null_class() as i64, &self.device);
            (
                Tensor::cat(vec![labels, null], 0),
                embeddings.map(|e| Tensor::cat(vec![e.clone(), e], 0)),
            )
        } else {
            (labels, embeddings)
        };

        info!(
            "Engine: streaming start [B={}, cond_len={}] steps={} guidance={}",
            batch, cond_len, config.steps, config.guidance_scale
        );

        Ok(Streamer {
            engine: self,
            config: config.clone(),
            rng: StdRng::seed_from_u64(config.seed),
            cache: KvCache::new(),
            input: Some(StepInput::Labels(labels)),
            embeddings,
            cond_len,
            batch,
            step: 0,
        })
    }

    /// Generate `config.steps` codes per label: `[B, steps]`, conditioning excluded.
    pub fn generate(
        &self,
        labels: Tensor<B, 1, Int>,
        embeddings: Option<Tensor<B, 3>>,
        config: &SampleConfig,
    ) -> Result<Tensor<B, 2, Int>> {
        self.generate_until(labels, embeddings, config, |_| false)
    }

    /// Like [`Self::generate`], but `stop(step)` is checked before each step and
    /// ends the run early when it returns true.
    pub fn generate_until<F>(
        &self,
        labels: Tensor<B, 1, Int>,
        embeddings: Option<Tensor<B, 3>>,
        config: &SampleConfig,
        mut stop: F,
    ) -> Result<Tensor<B, 2, Int>>
    where
        F: FnMut(usize) -> bool,
    {
        let [batch] = labels.dims();
        let mut streamer = self.stream(labels, embeddings, config)?;

        let mut out = Vec::with_capacity(config.steps);
        while !stop(streamer.step()) {
            match streamer.next() {
                Some(next) => out.push(next?),
                None => break,
            }
        }

        info!("Generation complete: {} new tokens", out.len());
        if out.is_empty() {
            return Ok(Tensor::<B, 2, Int>::zeros([batch, 0], &self.device));
        }
        Ok(Tensor::cat(out, 1))
    }
}

/// Step iterator over one generation run; yields the chosen codes `[B, 1]`.
pub struct Streamer<'a, B: Backend> {
    engine: &'a Engine<B>,
    config: SampleConfig,
    rng: StdRng,
    cache: KvCache<B>,
    /// Input of the next step; `None` once the run is done.
    input: Option<StepInput<B>>,
    embeddings: Option<Tensor<B, 3>>,
    cond_len: usize,
    batch: usize,
    step: usize,
}

impl<'a, B: Backend> Streamer<'a, B> {
    pub fn step(&self) -> usize {
        self.step
    }

    /// Positions currently held by the cache.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn advance(&mut self, input: StepInput<B>) -> Result<Tensor<B, 2, Int>> {
        let engine = self.engine;
        let n = self.step;
        let (past, past_length) = if n == 0 {
            (None, 0)
        } else {
            (Some(&self.cache), n + self.cond_len - 1)
        };
        let embeddings = if n == 0 { self.embeddings.take() } else { None };

        let (logits, present) = engine
            .model
            .forward_with_past(input, embeddings, past, past_length)?;
        self.cache.append(present);

        let logits = extract_last_logits(logits);
        let logits = if self.config.guided() {
            apply_guidance(logits, self.config.guidance_scale)
        } else {
            logits
        };
        let logits = apply_temperature(logits, self.config.temperature)?;
        let logits = top_k_top_p_filter(logits, self.config.top_k, self.config.top_p)?;
        let next = select_next(logits, self.config.sample_logits, &mut self.rng);

        debug!(
            "Streamer: step {} chose {:?}, cache T={}",
            n,
            next.dims(),
            self.cache.len()
        );
        Ok(next)
    }
}

impl<'a, B: Backend> Iterator for Streamer<'a, B> {
    type Item = Result<Tensor<B, 2, Int>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.step >= self.config.steps {
            if self.input.take().is_some() {
                info!("Streamer: finished after {} steps", self.step);
                self.cache.clear();
            }
            return None;
        }
        let input = self.input.take()?;

        match self.advance(input) {
            Ok(next) => {
                self.input = Some(StepInput::Tokens(if self.config.guided() {
                    Tensor::cat(vec![next.clone(), next.clone()], 0)
                } else {
                    next.clone()
                }));
                self.step += 1;
                debug_assert_eq!(next.dims(), [self.batch, 1]);
                Some(Ok(next))
            }
            Err(e) => {
                self.cache.clear();
                Some(Err(e))
            }
        }
    }
}

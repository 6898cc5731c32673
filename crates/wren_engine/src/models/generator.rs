//! Autoregressive text generator.
//!
//! The decoder is a residual feed-forward stack without a causal attention
//! mask; generation is autoregressive purely through the sampling loop.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{check_batch, tensor_to_ids, Model, ModelKind};
use crate::params::{ModelState, ParamStore};
use crate::tensor::{lookup_rows, softmax_row, Tensor};

const TEMP_MIN: f32 = 1e-6;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextGeneratorConfig {
    #[serde(default = "default_vocab")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_layers")]
    pub num_layers: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_vocab() -> usize {
    32000
}
fn default_hidden() -> usize {
    256
}
fn default_layers() -> usize {
    4
}
fn default_max_length() -> usize {
    512
}

impl Default for TextGeneratorConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab(),
            hidden_size: default_hidden(),
            num_layers: default_layers(),
            max_length: default_max_length(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub eos_token_id: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            eos_token_id: None,
        }
    }
}

pub struct TextGenerator {
    config: TextGeneratorConfig,
    store: ParamStore,
}

impl TextGenerator {
    pub fn new(config: TextGeneratorConfig) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 {
            return Err(EngineError::config(
                "generator needs vocab_size > 0 and hidden_size > 0".to_string(),
            ));
        }
        let mut model = Self {
            config,
            store: ParamStore::new("TextGenerator", "TextGenerator"),
        };
        model.init_parameters();
        model.store.state = ModelState::Initialized;
        Ok(model)
    }

    pub fn config(&self) -> &TextGeneratorConfig {
        &self.config
    }

    fn init_parameters(&mut self) {
        let cfg = &self.config;
        let h = cfg.hidden_size;
        let mut rng = rand::thread_rng();
        let scale = 1.0 / (h as f32).sqrt();

        self.store.set_param(
            "token_embedding",
            Tensor::randn(&[cfg.vocab_size, h], scale, &mut rng),
        );
        self.store.set_param(
            "position_embedding",
            Tensor::randn(&[cfg.max_length, h], 0.02, &mut rng),
        );

        for layer in 0..cfg.num_layers {
            self.store.set_param(
                format!("decoder_{layer}_w1"),
                Tensor::randn(&[h, h * 4], scale, &mut rng),
            );
            self.store
                .set_param(format!("decoder_{layer}_b1"), Tensor::zeros(&[h * 4]));
            self.store.set_param(
                format!("decoder_{layer}_w2"),
                Tensor::randn(&[h * 4, h], 1.0 / ((h * 4) as f32).sqrt(), &mut rng),
            );
            self.store
                .set_param(format!("decoder_{layer}_b2"), Tensor::zeros(&[h]));
        }

        self.store.set_param(
            "output_proj",
            Tensor::randn(&[h, cfg.vocab_size], scale, &mut rng),
        );
    }

    /// Logits [B, T, vocab] for token ids [B, T] (T is truncated to
    /// `max_length`).
    pub fn forward_ids(&self, ids: &[Vec<u32>]) -> Result<Tensor> {
        let truncated: Vec<Vec<u32>> = ids
            .iter()
            .map(|row| row.iter().copied().take(self.config.max_length).collect())
            .collect();
        let (b, t) = check_batch(&truncated, self.config.max_length)?;

        let token_emb = self.store.param("token_embedding")?;
        let pos_emb = self.store.param("position_embedding")?;
        let pos = pos_emb.as_f32()?;
        let h = self.config.hidden_size;

        let mut data = Vec::with_capacity(b * t * h);
        for row in &truncated {
            let emb = lookup_rows(token_emb, row)?;
            let emb = emb.as_f32()?;
            for ti in 0..t {
                for hi in 0..h {
                    data.push(emb[ti * h + hi] + pos[ti * h + hi]);
                }
            }
        }
        let mut x = Tensor::from_vec(data, &[b, t, h])?;

        for layer in 0..self.config.num_layers {
            let up = x
                .matmul(self.store.param(&format!("decoder_{layer}_w1"))?)?
                .add(self.store.param(&format!("decoder_{layer}_b1"))?)?
                .relu()?;
            let down = up
                .matmul(self.store.param(&format!("decoder_{layer}_w2"))?)?
                .add(self.store.param(&format!("decoder_{layer}_b2"))?)?;
            x = x.add(&down)?;
        }

        x.matmul(self.store.param("output_proj")?)
    }

    /// Sample a continuation of `prompt`. Stops at `max_new_tokens`, the
    /// model's `max_length`, or the eos token.
    pub fn generate(&self, prompt: &[u32], opts: &GenerateOptions) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(EngineError::shape("empty prompt".to_string()));
        }
        let vocab = self.config.vocab_size;
        let temp = opts.temperature.max(TEMP_MIN);
        let mut rng = rand::thread_rng();
        let mut generated = prompt.to_vec();

        for _ in 0..opts.max_new_tokens {
            if generated.len() >= self.config.max_length {
                break;
            }

            let logits = self.forward_ids(&[generated.clone()])?;
            let (_, t, v) = logits.dims3()?;
            let data = logits.as_f32()?;
            let mut next: Vec<f32> = data[(t - 1) * v..t * v].iter().map(|&x| x / temp).collect();

            if let Some(top_k) = opts.top_k {
                apply_top_k(&mut next, top_k);
            }
            if let Some(top_p) = opts.top_p {
                apply_top_p(&mut next, top_p)?;
            }

            let mut probs = vec![0.0f32; vocab];
            softmax_row(&next, &mut probs)?;
            let token = sample_multinomial(&probs, &mut rng);
            generated.push(token);

            if opts.eos_token_id == Some(token) {
                break;
            }
        }

        Ok(generated)
    }
}

/// Keep only the k largest logits; everything else becomes -inf.
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    // Ties at the threshold are kept left-to-right up to k entries total.
    let above = logits.iter().filter(|&&v| v > threshold).count();
    let mut tie_budget = k - above;
    for v in logits.iter_mut() {
        if *v > threshold {
            continue;
        }
        if *v == threshold && tie_budget > 0 {
            tie_budget -= 1;
            continue;
        }
        *v = f32::NEG_INFINITY;
    }
}

/// Nucleus filtering: keep the smallest prefix of the sorted distribution
/// whose cumulative probability exceeds p, always at least one token.
fn apply_top_p(logits: &mut [f32], p: f32) -> Result<()> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let sorted: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
    let mut probs = vec![0.0f32; sorted.len()];
    softmax_row(&sorted, &mut probs)?;

    let mut cumulative = 0.0f32;
    let mut cut = sorted.len();
    for (rank, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            cut = rank + 1;
            break;
        }
    }
    for &i in &order[cut..] {
        logits[i] = f32::NEG_INFINITY;
    }
    Ok(())
}

fn sample_multinomial<R: Rng>(probs: &[f32], rng: &mut R) -> u32 {
    let r: f32 = rng.gen();
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return i as u32;
        }
    }
    (probs.len() - 1) as u32
}

impl Model for TextGenerator {
    fn kind(&self) -> ModelKind {
        ModelKind::Generator
    }

    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.config.max_length]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.config.max_length, self.config.vocab_size]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ids = tensor_to_ids(input)?;
        self.forward_ids(&ids)
    }
}

//! Mean-pooled semantic encoder for embeddings and similarity search.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{check_batch, tensor_to_ids, Model, ModelKind};
use crate::params::{ModelState, ParamStore};
use crate::tensor::{lookup_rows, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticEncoderConfig {
    #[serde(default = "default_embedding")]
    pub embedding_dim: usize,
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_layers")]
    pub num_layers: usize,
    #[serde(default = "default_vocab")]
    pub vocab_size: usize,
    #[serde(default = "default_max_seq")]
    pub max_seq_length: usize,
    #[serde(default = "default_normalize")]
    pub normalize_output: bool,
}

fn default_embedding() -> usize {
    384
}
fn default_hidden() -> usize {
    256
}
fn default_layers() -> usize {
    2
}
fn default_vocab() -> usize {
    32000
}
fn default_max_seq() -> usize {
    512
}
fn default_normalize() -> bool {
    true
}

impl Default for SemanticEncoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding(),
            hidden_size: default_hidden(),
            num_layers: default_layers(),
            vocab_size: default_vocab(),
            max_seq_length: default_max_seq(),
            normalize_output: default_normalize(),
        }
    }
}

/// A single search hit: corpus row index and cosine score.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub index: usize,
    pub score: f32,
}

/// Token + position embedding, residual FFN blocks, mean pool, projection
/// to `embedding_dim`, optional L2 normalization.
pub struct SemanticEncoder {
    config: SemanticEncoderConfig,
    store: ParamStore,
}

impl SemanticEncoder {
    pub fn new(config: SemanticEncoderConfig) -> Result<Self> {
        if config.embedding_dim == 0 || config.hidden_size == 0 {
            return Err(EngineError::config(
                "encoder dims must be non-zero".to_string(),
            ));
        }
        let mut model = Self {
            config,
            store: ParamStore::new("SemanticEncoder", "SemanticEncoder"),
        };
        model.init_parameters();
        model.store.state = ModelState::Initialized;
        Ok(model)
    }

    pub fn config(&self) -> &SemanticEncoderConfig {
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
            Tensor::randn(&[cfg.max_seq_length, h], 0.02, &mut rng),
        );

        for layer in 0..cfg.num_layers {
            self.store.set_param(
                format!("encoder_{layer}_w1"),
                Tensor::randn(&[h, h * 4], scale, &mut rng),
            );
            self.store
                .set_param(format!("encoder_{layer}_b1"), Tensor::zeros(&[h * 4]));
            self.store.set_param(
                format!("encoder_{layer}_w2"),
                Tensor::randn(&[h * 4, h], 1.0 / ((h * 4) as f32).sqrt(), &mut rng),
            );
            self.store
                .set_param(format!("encoder_{layer}_b2"), Tensor::zeros(&[h]));
        }

        self.store.set_param(
            "output_proj",
            Tensor::randn(&[h, cfg.embedding_dim], scale, &mut rng),
        );
        self.store
            .set_param("output_bias", Tensor::zeros(&[cfg.embedding_dim]));
    }

    /// Encode token ids [B, T] to embeddings [B, embedding_dim]. Sequences
    /// longer than `max_seq_length` are truncated.
    pub fn encode(&self, ids: &[Vec<u32>]) -> Result<Tensor> {
        let truncated: Vec<Vec<u32>> = ids
            .iter()
            .map(|row| {
                row.iter()
                    .copied()
                    .take(self.config.max_seq_length)
                    .collect()
            })
            .collect();
        let (b, t) = check_batch(&truncated, self.config.max_seq_length)?;

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

        // Residual FFN blocks: up -> ReLU -> down, plus skip.
        for layer in 0..self.config.num_layers {
            let up = x
                .matmul(self.store.param(&format!("encoder_{layer}_w1"))?)?
                .add(self.store.param(&format!("encoder_{layer}_b1"))?)?
                .relu()?;
            let down = up
                .matmul(self.store.param(&format!("encoder_{layer}_w2"))?)?
                .add(self.store.param(&format!("encoder_{layer}_b2"))?)?;
            x = x.add(&down)?;
        }

        let pooled = x.mean_axis1()?;
        let embeddings = pooled
            .matmul(self.store.param("output_proj")?)?
            .add(self.store.param("output_bias")?)?;

        if self.config.normalize_output {
            embeddings.l2_normalize()
        } else {
            Ok(embeddings)
        }
    }

    /// Cosine similarity matrix [|A|, |B|]; both sides are re-normalized as
    /// a safeguard against unnormalized inputs.
    pub fn similarity(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let a = a.l2_normalize()?;
        let b = b.l2_normalize()?;
        a.matmul(&b.transpose2d()?)
    }

    /// Top-k corpus rows by cosine score, descending.
    pub fn search(&self, query: &Tensor, corpus: &Tensor, top_k: usize) -> Result<Vec<SearchHit>> {
        let query = if query.rank() == 1 {
            query.reshape(&[1, query.len()])?
        } else {
            query.clone()
        };
        let sims = self.similarity(&query, corpus)?;
        let row = sims.as_f32()?;
        let n = corpus.dims2()?.0;

        let mut hits: Vec<SearchHit> = (0..n)
            .map(|i| SearchHit {
                index: i,
                score: row[i],
            })
            .collect();
        hits.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

impl Model for SemanticEncoder {
    fn kind(&self) -> ModelKind {
        ModelKind::Encoder
    }

    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.config.max_seq_length]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.config.embedding_dim]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ids = tensor_to_ids(input)?;
        self.encode(&ids)
    }
}

//! Compact encoder-only transformer for cross-platform inference.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{check_batch, tensor_to_ids, Model, ModelKind};
use crate::params::{ModelState, ParamStore};
use crate::tensor::{lookup_rows, softmax_row, Tensor};

/// Additive mask value for disallowed attention positions.
const MASK_NEG: f32 = -1e9;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_layers")]
    pub num_layers: usize,
    #[serde(default = "default_heads")]
    pub num_heads: usize,
    #[serde(default = "default_intermediate")]
    pub intermediate_size: usize,
    #[serde(default = "default_max_seq")]
    pub max_seq_length: usize,
    #[serde(default = "default_vocab")]
    pub vocab_size: usize,
    /// Present for artifact parity; never applied at inference time.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_hidden() -> usize {
    256
}
fn default_layers() -> usize {
    4
}
fn default_heads() -> usize {
    4
}
fn default_intermediate() -> usize {
    1024
}
fn default_max_seq() -> usize {
    512
}
fn default_vocab() -> usize {
    32000
}
fn default_dropout() -> f32 {
    0.1
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden(),
            num_layers: default_layers(),
            num_heads: default_heads(),
            intermediate_size: default_intermediate(),
            max_seq_length: default_max_seq(),
            vocab_size: default_vocab(),
            dropout: default_dropout(),
        }
    }
}

/// Pre-norm multi-head self-attention encoder. Forward maps token ids
/// [B, T] to hidden states [B, T, hidden]; `encode` reduces across time.
pub struct TransformerLite {
    config: TransformerConfig,
    head_dim: usize,
    store: ParamStore,
}

impl TransformerLite {
    pub fn new(config: TransformerConfig) -> Result<Self> {
        if config.num_heads == 0 || config.hidden_size % config.num_heads != 0 {
            return Err(EngineError::config(format!(
                "hidden_size {} must be divisible by num_heads {}",
                config.hidden_size, config.num_heads
            )));
        }
        let head_dim = config.hidden_size / config.num_heads;
        let mut model = Self {
            config,
            head_dim,
            store: ParamStore::new("TransformerLite", "TransformerLite"),
        };
        model.init_parameters();
        model.store.state = ModelState::Initialized;
        Ok(model)
    }

    pub fn config(&self) -> &TransformerConfig {
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
            let prefix = format!("layer_{layer}");
            for proj in ["query", "key", "value", "attn_out"] {
                self.store.set_param(
                    format!("{prefix}_{proj}"),
                    Tensor::randn(&[h, h], scale, &mut rng),
                );
                self.store
                    .set_param(format!("{prefix}_{proj}_bias"), Tensor::zeros(&[h]));
            }

            self.store
                .set_param(format!("{prefix}_ln1_gamma"), Tensor::ones(&[h]));
            self.store
                .set_param(format!("{prefix}_ln1_beta"), Tensor::zeros(&[h]));

            self.store.set_param(
                format!("{prefix}_ffn_up"),
                Tensor::randn(&[h, cfg.intermediate_size], scale, &mut rng),
            );
            self.store.set_param(
                format!("{prefix}_ffn_up_bias"),
                Tensor::zeros(&[cfg.intermediate_size]),
            );
            self.store.set_param(
                format!("{prefix}_ffn_down"),
                Tensor::randn(
                    &[cfg.intermediate_size, h],
                    1.0 / (cfg.intermediate_size as f32).sqrt(),
                    &mut rng,
                ),
            );
            self.store
                .set_param(format!("{prefix}_ffn_down_bias"), Tensor::zeros(&[h]));

            self.store
                .set_param(format!("{prefix}_ln2_gamma"), Tensor::ones(&[h]));
            self.store
                .set_param(format!("{prefix}_ln2_beta"), Tensor::zeros(&[h]));
        }

        self.store.set_param("final_ln_gamma", Tensor::ones(&[h]));
        self.store.set_param("final_ln_beta", Tensor::zeros(&[h]));
    }

    /// Forward pass: ids [B, T] (T <= max_seq_length) -> [B, T, hidden].
    /// `attention_mask` rows are {0, 1}; zeros become additive -1e9 on the
    /// masked key positions.
    pub fn forward_ids(
        &self,
        ids: &[Vec<u32>],
        attention_mask: Option<&[Vec<f32>]>,
    ) -> Result<Tensor> {
        let (b, t) = check_batch(ids, self.config.max_seq_length)?;
        if let Some(mask) = attention_mask {
            if mask.len() != b || mask.iter().any(|row| row.len() != t) {
                return Err(EngineError::shape(format!(
                    "attention mask must be [{b}, {t}]"
                )));
            }
        }

        let token_emb = self.store.param("token_embedding")?;
        let pos_emb = self.store.param("position_embedding")?;
        let h = self.config.hidden_size;
        let pos = pos_emb.as_f32()?;

        // x = token_emb[ids] + pos_emb[0..T]
        let mut data = Vec::with_capacity(b * t * h);
        for row in ids {
            let emb = lookup_rows(token_emb, row)?;
            let emb = emb.as_f32()?;
            for ti in 0..t {
                for hi in 0..h {
                    data.push(emb[ti * h + hi] + pos[ti * h + hi]);
                }
            }
        }
        let mut hidden = Tensor::from_vec(data, &[b, t, h])?;

        for layer in 0..self.config.num_layers {
            hidden = self.block(&hidden, layer, attention_mask)?;
        }

        hidden.layer_norm(
            self.store.param("final_ln_gamma")?,
            self.store.param("final_ln_beta")?,
        )
    }

    fn block(
        &self,
        hidden: &Tensor,
        layer: usize,
        attention_mask: Option<&[Vec<f32>]>,
    ) -> Result<Tensor> {
        let prefix = format!("layer_{layer}");

        // Pre-norm attention branch plus residual.
        let normed = hidden.layer_norm(
            self.store.param(&format!("{prefix}_ln1_gamma"))?,
            self.store.param(&format!("{prefix}_ln1_beta"))?,
        )?;
        let attn = self.attention(&normed, &prefix, attention_mask)?;
        let hidden = hidden.add(&attn)?;

        // Pre-norm FFN branch plus residual.
        let normed = hidden.layer_norm(
            self.store.param(&format!("{prefix}_ln2_gamma"))?,
            self.store.param(&format!("{prefix}_ln2_beta"))?,
        )?;
        let up = normed
            .matmul(self.store.param(&format!("{prefix}_ffn_up"))?)?
            .add(self.store.param(&format!("{prefix}_ffn_up_bias"))?)?
            .gelu()?;
        let down = up
            .matmul(self.store.param(&format!("{prefix}_ffn_down"))?)?
            .add(self.store.param(&format!("{prefix}_ffn_down_bias"))?)?;
        hidden.add(&down)
    }

    fn attention(
        &self,
        x: &Tensor,
        prefix: &str,
        attention_mask: Option<&[Vec<f32>]>,
    ) -> Result<Tensor> {
        let (b, t, h) = x.dims3()?;
        let heads = self.config.num_heads;
        let hd = self.head_dim;
        let scale = 1.0 / (hd as f32).sqrt();

        let q = x
            .matmul(self.store.param(&format!("{prefix}_query"))?)?
            .add(self.store.param(&format!("{prefix}_query_bias"))?)?;
        let k = x
            .matmul(self.store.param(&format!("{prefix}_key"))?)?
            .add(self.store.param(&format!("{prefix}_key_bias"))?)?;
        let v = x
            .matmul(self.store.param(&format!("{prefix}_value"))?)?
            .add(self.store.param(&format!("{prefix}_value_bias"))?)?;

        let qd = q.as_f32()?;
        let kd = k.as_f32()?;
        let vd = v.as_f32()?;

        let mut context = vec![0.0f32; b * t * h];
        let mut scores = vec![0.0f32; t];
        let mut probs = vec![0.0f32; t];

        for bi in 0..b {
            for head in 0..heads {
                let off = head * hd;
                for t1 in 0..t {
                    let q_row = &qd[(bi * t + t1) * h + off..(bi * t + t1) * h + off + hd];
                    for t2 in 0..t {
                        let k_row = &kd[(bi * t + t2) * h + off..(bi * t + t2) * h + off + hd];
                        let mut s = q_row
                            .iter()
                            .zip(k_row.iter())
                            .map(|(&a, &c)| a * c)
                            .sum::<f32>()
                            * scale;
                        if let Some(mask) = attention_mask {
                            if mask[bi][t2] == 0.0 {
                                s += MASK_NEG;
                            }
                        }
                        scores[t2] = s;
                    }
                    softmax_row(&scores, &mut probs)?;
                    let c_base = (bi * t + t1) * h + off;
                    for t2 in 0..t {
                        let p = probs[t2];
                        if p == 0.0 {
                            continue;
                        }
                        let v_row = &vd[(bi * t + t2) * h + off..(bi * t + t2) * h + off + hd];
                        for (i, &vv) in v_row.iter().enumerate() {
                            context[c_base + i] += p * vv;
                        }
                    }
                }
            }
        }

        Tensor::from_vec(context, &[b, t, h])?
            .matmul(self.store.param(&format!("{prefix}_attn_out"))?)?
            .add(self.store.param(&format!("{prefix}_attn_out_bias"))?)
    }

    /// Reduce hidden states across time: `mean`, `cls` (first token), or
    /// `max`. Anything else is a config error.
    pub fn encode(&self, ids: &[Vec<u32>], pooling: &str) -> Result<Tensor> {
        let hidden = self.forward_ids(ids, None)?;
        match pooling {
            "mean" => hidden.mean_axis1(),
            "max" => hidden.max_axis1(),
            "cls" => {
                let (b, t, h) = hidden.dims3()?;
                let data = hidden.as_f32()?;
                let mut out = Vec::with_capacity(b * h);
                for bi in 0..b {
                    out.extend_from_slice(&data[bi * t * h..bi * t * h + h]);
                }
                Tensor::from_vec(out, &[b, h])
            }
            other => Err(EngineError::config(format!(
                "unknown pooling strategy: {other}"
            ))),
        }
    }
}

impl Model for TransformerLite {
    fn kind(&self) -> ModelKind {
        ModelKind::Transformer
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
        vec![self.config.max_seq_length, self.config.hidden_size]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ids = tensor_to_ids(input)?;
        self.forward_ids(&ids, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransformerLite {
        TransformerLite::new(TransformerConfig {
            hidden_size: 64,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 128,
            max_seq_length: 32,
            vocab_size: 1000,
            dropout: 0.0,
        })
        .unwrap()
    }

    fn ids(b: usize, t: usize) -> Vec<Vec<u32>> {
        (0..b)
            .map(|bi| (0..t).map(|ti| ((bi * 31 + ti * 7) % 1000) as u32).collect())
            .collect()
    }

    #[test]
    fn forward_shape() {
        let model = small();
        let out = model.forward_ids(&ids(2, 16), None).unwrap();
        assert_eq!(out.shape(), &[2, 16, 64]);
    }

    #[test]
    fn encode_mean_shape() {
        let model = small();
        let out = model.encode(&ids(2, 16), "mean").unwrap();
        assert_eq!(out.shape(), &[2, 64]);
    }

    #[test]
    fn unknown_pooling_is_config_error() {
        let model = small();
        assert!(matches!(
            model.encode(&ids(1, 4), "median"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn sequence_over_max_is_shape_error() {
        let model = small();
        assert!(matches!(
            model.forward_ids(&ids(1, 33), None),
            Err(EngineError::Shape(_))
        ));
    }

    #[test]
    fn masked_positions_do_not_change_unmasked_identity() {
        // A fully-on mask must reproduce the unmasked forward exactly.
        let model = small();
        let input = ids(1, 8);
        let mask = vec![vec![1.0f32; 8]];
        let a = model.forward_ids(&input, None).unwrap();
        let b = model.forward_ids(&input, Some(&mask)).unwrap();
        for (x, y) in a
            .as_f32()
            .unwrap()
            .iter()
            .zip(b.as_f32().unwrap().iter())
        {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn parameter_count_matches_sum() {
        let model = small();
        let total: usize = model.store().params().iter().map(|(_, t)| t.len()).sum();
        assert_eq!(model.num_parameters(), total);
    }
}

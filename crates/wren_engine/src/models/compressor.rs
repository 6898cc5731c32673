//! Byte-level LSTM next-byte predictor: the probability model behind the
//! neural compression layer.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{check_batch, tensor_to_ids, Model, ModelKind};
use crate::params::{ModelState, ParamStore};
use crate::tensor::{lookup_rows, Tensor};

/// Floor for sampling temperature to avoid division by zero.
const TEMP_MIN: f32 = 1e-6;

/// Byte vocabulary.
pub const BYTE_VOCAB: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NeuralCompressorConfig {
    #[serde(default = "default_context")]
    pub context_size: usize,
    #[serde(default = "default_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_layers")]
    pub num_layers: usize,
}

fn default_context() -> usize {
    1024
}
fn default_hidden() -> usize {
    128
}
fn default_layers() -> usize {
    2
}

impl Default for NeuralCompressorConfig {
    fn default() -> Self {
        Self {
            context_size: default_context(),
            hidden_size: default_hidden(),
            num_layers: default_layers(),
        }
    }
}

/// Recurrent carry: one (h, c) pair of [B, hidden] tensors per layer.
/// Copy-on-write for callers — forward never mutates the carry it was given.
#[derive(Clone, Debug)]
pub struct LstmState {
    pub h: Vec<Tensor>,
    pub c: Vec<Tensor>,
}

impl LstmState {
    pub fn zeros(num_layers: usize, batch: usize, hidden: usize) -> Self {
        Self {
            h: (0..num_layers).map(|_| Tensor::zeros(&[batch, hidden])).collect(),
            c: (0..num_layers).map(|_| Tensor::zeros(&[batch, hidden])).collect(),
        }
    }
}

/// Compression hints derived from the model's entropy estimate.
#[derive(Clone, Debug, Serialize)]
pub struct CompressionHints {
    pub entropy_bits_per_byte: f64,
    pub theoretical_min_ratio: f64,
    pub recommended_algorithm: &'static str,
    pub context_length: usize,
}

pub struct NeuralCompressor {
    config: NeuralCompressorConfig,
    store: ParamStore,
}

impl NeuralCompressor {
    pub fn new(config: NeuralCompressorConfig) -> Result<Self> {
        if config.hidden_size == 0 || config.num_layers == 0 {
            return Err(EngineError::config(
                "compressor needs hidden_size > 0 and num_layers > 0".to_string(),
            ));
        }
        let mut model = Self {
            config,
            store: ParamStore::new("NeuralCompressor", "NeuralCompressor"),
        };
        model.init_parameters();
        model.store.state = ModelState::Initialized;
        Ok(model)
    }

    pub fn config(&self) -> &NeuralCompressorConfig {
        &self.config
    }

    fn init_parameters(&mut self) {
        let h = self.config.hidden_size;
        let mut rng = rand::thread_rng();
        let scale = 1.0 / (h as f32).sqrt();

        self.store
            .set_param("embedding", Tensor::randn(&[BYTE_VOCAB, h], scale, &mut rng));

        for layer in 0..self.config.num_layers {
            self.store.set_param(
                format!("lstm_{layer}_ih"),
                Tensor::randn(&[h, 4 * h], scale, &mut rng),
            );
            self.store.set_param(
                format!("lstm_{layer}_hh"),
                Tensor::randn(&[h, 4 * h], scale, &mut rng),
            );
            self.store
                .set_param(format!("lstm_{layer}_bias"), Tensor::zeros(&[4 * h]));
        }

        self.store.set_param(
            "output_proj",
            Tensor::randn(&[h, BYTE_VOCAB], scale, &mut rng),
        );
        self.store
            .set_param("output_bias", Tensor::zeros(&[BYTE_VOCAB]));
    }

    /// One cell step: gates = x W_ih + h W_hh + b, split i,f,g,o.
    fn cell(
        &self,
        x: &Tensor,
        h_prev: &Tensor,
        c_prev: &Tensor,
        layer: usize,
    ) -> Result<(Tensor, Tensor)> {
        let hid = self.config.hidden_size;
        let w_ih = self.store.param(&format!("lstm_{layer}_ih"))?;
        let w_hh = self.store.param(&format!("lstm_{layer}_hh"))?;
        let bias = self.store.param(&format!("lstm_{layer}_bias"))?;

        let gates = x.matmul(w_ih)?.add(&h_prev.matmul(w_hh)?)?.add(bias)?;

        let i = gates.slice_last(0, hid)?.sigmoid()?;
        let f = gates.slice_last(hid, hid)?.sigmoid()?;
        let g = gates.slice_last(2 * hid, hid)?.tanh()?;
        let o = gates.slice_last(3 * hid, hid)?.sigmoid()?;

        let c = f.mul(c_prev)?.add(&i.mul(&g)?)?;
        let h = o.mul(&c.tanh()?)?;
        Ok((h, c))
    }

    /// Run the LSTM stack over byte ids [B, T]. Returns logits [B, T, 256]
    /// and the updated carry.
    pub fn forward_ids(
        &self,
        ids: &[Vec<u32>],
        state: Option<&LstmState>,
    ) -> Result<(Tensor, LstmState)> {
        let (b, t) = check_batch(ids, usize::MAX)?;
        let hid = self.config.hidden_size;
        let layers = self.config.num_layers;

        let mut state = match state {
            Some(s) => {
                if s.h.len() != layers || s.h[0].shape() != [b, hid].as_slice() {
                    return Err(EngineError::shape(format!(
                        "carry does not match {layers} layers x [{b}, {hid}]"
                    )));
                }
                s.clone()
            }
            None => LstmState::zeros(layers, b, hid),
        };

        let embedding = self.store.param("embedding")?;

        // Embed the whole batch once, then step through time.
        let mut embedded = Vec::with_capacity(b);
        for row in ids {
            embedded.push(lookup_rows(embedding, row)?);
        }

        let mut outputs = Vec::with_capacity(t);
        for ti in 0..t {
            // Gather timestep ti across the batch -> [B, hidden].
            let mut step = Vec::with_capacity(b * hid);
            for emb in &embedded {
                let data = emb.as_f32()?;
                step.extend_from_slice(&data[ti * hid..(ti + 1) * hid]);
            }
            let mut layer_input = Tensor::from_vec(step, &[b, hid])?;

            for layer in 0..layers {
                let (h, c) = self.cell(&layer_input, &state.h[layer], &state.c[layer], layer)?;
                state.h[layer] = h.clone();
                state.c[layer] = c;
                layer_input = h;
            }
            outputs.push(layer_input);
        }

        // [T] x [B, hidden] -> [B, T, hidden]
        let mut seq = Vec::with_capacity(b * t * hid);
        for bi in 0..b {
            for out in &outputs {
                let data = out.as_f32()?;
                seq.extend_from_slice(&data[bi * hid..(bi + 1) * hid]);
            }
        }
        let hidden = Tensor::from_vec(seq, &[b, t, hid])?;

        let logits = hidden
            .matmul(self.store.param("output_proj")?)?
            .add(self.store.param("output_bias")?)?;
        Ok((logits, state))
    }

    /// Probability distribution over the next byte for each batch row.
    /// Returns [B, 256] probabilities plus the new carry.
    pub fn predict_next_byte(
        &self,
        context: &[Vec<u8>],
        state: Option<&LstmState>,
        temperature: f32,
    ) -> Result<(Tensor, LstmState)> {
        let ids: Vec<Vec<u32>> = context
            .iter()
            .map(|row| row.iter().map(|&b| b as u32).collect())
            .collect();
        let (logits, new_state) = self.forward_ids(&ids, state)?;

        let (b, t, v) = logits.dims3()?;
        let temp = temperature.max(TEMP_MIN);
        let data = logits.as_f32()?;
        let mut probs = vec![0.0f32; b * v];
        for bi in 0..b {
            let last = &data[(bi * t + t - 1) * v..(bi * t + t) * v];
            let scaled: Vec<f32> = last.iter().map(|&x| x / temp).collect();
            crate::tensor::softmax_row(&scaled, &mut probs[bi * v..(bi + 1) * v])?;
        }
        Ok((Tensor::from_vec(probs, &[b, v])?, new_state))
    }

    /// Average surprisal of `data` under the model, in bits per byte.
    /// Defined as 0 for empty input; the divisor is clamped at 1 so a
    /// single byte does not divide by zero.
    pub fn estimate_entropy(&self, data: &[u8], chunk_size: usize) -> Result<f64> {
        if data.is_empty() {
            return Ok(0.0);
        }
        let chunk_size = chunk_size.max(1);

        let mut total_log_prob = 0.0f64;
        let mut state: Option<LstmState> = None;

        let mut start = 0usize;
        while start < data.len().saturating_sub(1) {
            let end = (start + chunk_size).min(data.len() - 1);
            let inputs: Vec<u32> = data[start..end].iter().map(|&b| b as u32).collect();
            let targets = &data[start + 1..=end];

            let (logits, new_state) = self.forward_ids(&[inputs], state.as_ref())?;
            state = Some(new_state);

            let (_, t, v) = logits.dims3()?;
            let ld = logits.as_f32()?;
            for (ti, &target) in targets.iter().enumerate().take(t) {
                let row = &ld[ti * v..(ti + 1) * v];
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let log_z: f64 =
                    (row.iter().map(|&x| ((x - max) as f64).exp()).sum::<f64>()).ln() + max as f64;
                total_log_prob += row[target as usize] as f64 - log_z;
            }

            start = end;
        }

        let divisor = (data.len() - 1).max(1) as f64;
        Ok(-total_log_prob / divisor / std::f64::consts::LN_2)
    }

    /// Entropy-driven compression hints for a payload.
    pub fn compress_context(&self, data: &[u8]) -> Result<CompressionHints> {
        let entropy = self.estimate_entropy(data, 512)?;
        let theoretical_min_ratio = if entropy > 0.0 {
            8.0 / entropy
        } else {
            f64::INFINITY
        };
        Ok(CompressionHints {
            entropy_bits_per_byte: entropy,
            theoretical_min_ratio,
            recommended_algorithm: recommend_algorithm(entropy),
            context_length: data.len(),
        })
    }
}

/// Bucket an entropy estimate into the primary algorithm choice.
pub fn recommend_algorithm(entropy: f64) -> &'static str {
    if entropy < 1.0 {
        "rle"
    } else if entropy < 3.0 {
        "dictionary"
    } else if entropy < 6.0 {
        "hybrid"
    } else {
        "arithmetic"
    }
}

impl Model for NeuralCompressor {
    fn kind(&self) -> ModelKind {
        ModelKind::Compressor
    }

    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.config.context_size]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.config.context_size, BYTE_VOCAB]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let ids = tensor_to_ids(input)?;
        let (logits, _) = self.forward_ids(&ids, None)?;
        Ok(logits)
    }
}

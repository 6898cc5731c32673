//! Feed-forward classifier with softmax and sigmoid heads.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{Model, ModelKind};
use crate::params::{ModelState, ParamStore};
use crate::tensor::{sigmoid_scalar, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_input")]
    pub input_dim: usize,
    #[serde(default = "default_hidden")]
    pub hidden_dims: Vec<usize>,
    #[serde(default = "default_classes")]
    pub num_classes: usize,
    #[serde(default)]
    pub multi_label: bool,
    /// Metadata parity only; inference never applies it.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_input() -> usize {
    256
}
fn default_hidden() -> Vec<usize> {
    vec![128, 64]
}
fn default_classes() -> usize {
    2
}
fn default_dropout() -> f32 {
    0.1
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input(),
            hidden_dims: default_hidden(),
            num_classes: default_classes(),
            multi_label: false,
            dropout: default_dropout(),
        }
    }
}

/// MLP over [B, input_dim] with ReLU hidden layers and a linear head.
pub struct Classifier {
    config: ClassifierConfig,
    store: ParamStore,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        if config.input_dim == 0 || config.num_classes == 0 {
            return Err(EngineError::config(
                "classifier needs input_dim > 0 and num_classes > 0".to_string(),
            ));
        }
        let mut model = Self {
            config,
            store: ParamStore::new("Classifier", "Classifier"),
        };
        model.init_parameters();
        model.store.state = ModelState::Initialized;
        Ok(model)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn dims(&self) -> Vec<usize> {
        let mut dims = vec![self.config.input_dim];
        dims.extend_from_slice(&self.config.hidden_dims);
        dims.push(self.config.num_classes);
        dims
    }

    fn init_parameters(&mut self) {
        let dims = self.dims();
        let mut rng = rand::thread_rng();
        for i in 0..dims.len() - 1 {
            let scale = 1.0 / (dims[i] as f32).sqrt();
            self.store.set_param(
                format!("layer_{i}_weight"),
                Tensor::randn(&[dims[i], dims[i + 1]], scale, &mut rng),
            );
            self.store
                .set_param(format!("layer_{i}_bias"), Tensor::zeros(&[dims[i + 1]]));
        }
    }

    /// Logits [B, num_classes].
    pub fn forward_features(&self, x: &Tensor) -> Result<Tensor> {
        let input_dim = self.config.input_dim;
        let x = match x.rank() {
            1 => x.reshape(&[1, x.len()])?,
            2 => x.clone(),
            r => {
                return Err(EngineError::shape(format!(
                    "classifier input must be rank 1 or 2, got rank {r}"
                )))
            }
        };
        if x.shape()[1] != input_dim {
            return Err(EngineError::shape(format!(
                "classifier expects feature dim {}, got {}",
                input_dim,
                x.shape()[1]
            )));
        }

        let num_layers = self.config.hidden_dims.len() + 1;
        let mut hidden = x;
        for i in 0..num_layers {
            hidden = hidden
                .matmul(self.store.param(&format!("layer_{i}_weight"))?)?
                .add(self.store.param(&format!("layer_{i}_bias"))?)?;
            if i < num_layers - 1 {
                hidden = hidden.relu()?;
            }
        }
        Ok(hidden)
    }

    /// Class probabilities: softmax rows for multi-class, independent
    /// sigmoids for multi-label.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.forward_features(x)?;
        if self.config.multi_label {
            let data = logits.as_f32()?.iter().map(|&v| sigmoid_scalar(v)).collect();
            Tensor::from_vec(data, logits.shape())
        } else {
            logits.softmax()
        }
    }

    /// Argmax class index per row (multi-class head).
    pub fn predict_argmax(&self, x: &Tensor) -> Result<Vec<usize>> {
        let probs = self.predict(x)?;
        let (b, c) = probs.dims2()?;
        let data = probs.as_f32()?;
        Ok((0..b)
            .map(|bi| {
                let row = &data[bi * c..(bi + 1) * c];
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect())
    }

    /// Thresholded label sets per row (multi-label head).
    pub fn predict_labels(&self, x: &Tensor, threshold: f32) -> Result<Vec<Vec<usize>>> {
        let probs = self.predict(x)?;
        let (b, c) = probs.dims2()?;
        let data = probs.as_f32()?;
        Ok((0..b)
            .map(|bi| {
                (0..c)
                    .filter(|&ci| data[bi * c + ci] > threshold)
                    .collect()
            })
            .collect())
    }
}

impl Model for Classifier {
    fn kind(&self) -> ModelKind {
        ModelKind::Classifier
    }

    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.config.input_dim]
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.config.num_classes]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_features(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Classifier {
        Classifier::new(ClassifierConfig {
            input_dim: 8,
            hidden_dims: vec![4],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap()
    }

    #[test]
    fn forward_shape_and_softmax_rows() {
        let model = small();
        let mut rng = rand::thread_rng();
        let x = Tensor::randn(&[4, 8], 1.0, &mut rng);
        let probs = model.predict(&x).unwrap();
        assert_eq!(probs.shape(), &[4, 2]);
        for row in probs.as_f32().unwrap().chunks(2) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn argmax_picks_highest_probability() {
        let model = small();
        let mut rng = rand::thread_rng();
        let x = Tensor::randn(&[3, 8], 1.0, &mut rng);
        let probs = model.predict(&x).unwrap();
        let labels = model.predict_argmax(&x).unwrap();
        let data = probs.as_f32().unwrap();
        for (bi, &label) in labels.iter().enumerate() {
            let row = &data[bi * 2..(bi + 1) * 2];
            assert!(row[label] >= row[1 - label]);
        }
    }

    #[test]
    fn multi_label_thresholding() {
        let model = Classifier::new(ClassifierConfig {
            input_dim: 4,
            hidden_dims: vec![],
            num_classes: 3,
            multi_label: true,
            dropout: 0.0,
        })
        .unwrap();
        let x = Tensor::zeros(&[1, 4]);
        // Zero input with zero bias gives sigmoid(0) = 0.5 everywhere.
        let labels = model.predict_labels(&x, 0.5).unwrap();
        assert!(labels[0].is_empty());
        let labels = model.predict_labels(&x, 0.4).unwrap();
        assert_eq!(labels[0], vec![0, 1, 2]);
    }

    #[test]
    fn wrong_feature_dim_is_shape_error() {
        let model = small();
        let x = Tensor::zeros(&[2, 5]);
        assert!(matches!(
            model.forward_features(&x),
            Err(EngineError::Shape(_))
        ));
    }

    #[test]
    fn rank1_input_gets_batch_axis() {
        let model = small();
        let x = Tensor::zeros(&[8]);
        let out = model.forward_features(&x).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
    }
}

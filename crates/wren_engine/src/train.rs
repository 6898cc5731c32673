//! Diagnostic trainer built on finite-difference gradient sampling.
//!
//! This is a smoke-test capability, not a production trainer: gradients are
//! estimated by perturbing a random sample of parameter indices, which is
//! far too slow and too noisy to fit real models. Production models are
//! trained out-of-band and loaded as artifacts. What this module guarantees
//! is that a perturbation never outlives its gradient step: every touched
//! index is restored before the step returns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::Model;
use crate::params::{ModelState, ParamStore};
use crate::tensor::Tensor;

/// Central-difference step, sized for f32 loss resolution.
const FD_EPS: f32 = 1e-3;

// ============================================================
// Losses and metrics
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    CrossEntropy,
    Mse,
    Mae,
}

impl LossKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cross_entropy" => Ok(LossKind::CrossEntropy),
            "mse" => Ok(LossKind::Mse),
            "mae" => Ok(LossKind::Mae),
            other => Err(EngineError::config(format!("unknown loss type: {other}"))),
        }
    }
}

/// Loss between predictions and targets. Cross-entropy accepts soft targets
/// (same shape as the logits) or hard class indices (one fewer axis, values
/// rounded); MSE/MAE require matching shapes.
pub fn compute_loss(predictions: &Tensor, targets: &Tensor, kind: LossKind) -> Result<f32> {
    match kind {
        LossKind::Mse => {
            let p = predictions.as_f32()?;
            let t = same_shape(predictions, targets)?;
            let sum: f32 = p.iter().zip(t.iter()).map(|(&a, &b)| (a - b) * (a - b)).sum();
            Ok(sum / p.len() as f32)
        }
        LossKind::Mae => {
            let p = predictions.as_f32()?;
            let t = same_shape(predictions, targets)?;
            let sum: f32 = p.iter().zip(t.iter()).map(|(&a, &b)| (a - b).abs()).sum();
            Ok(sum / p.len() as f32)
        }
        LossKind::CrossEntropy => cross_entropy(predictions, targets),
    }
}

fn same_shape<'t>(predictions: &Tensor, targets: &'t Tensor) -> Result<&'t [f32]> {
    if predictions.shape() != targets.shape() {
        return Err(EngineError::shape(format!(
            "loss shape mismatch: {:?} vs {:?}",
            predictions.shape(),
            targets.shape()
        )));
    }
    targets.as_f32()
}

fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<f32> {
    let classes = *logits
        .shape()
        .last()
        .ok_or_else(|| EngineError::shape("rank-0 logits".to_string()))?;
    let data = logits.as_f32()?;
    let rows = data.len() / classes;

    if logits.shape() == targets.shape() {
        // Soft targets: mean over rows of -(sum t * log_softmax).
        let t = targets.as_f32()?;
        let mut total = 0.0f64;
        for (row, trow) in data.chunks(classes).zip(t.chunks(classes)) {
            let log_probs = log_softmax(row);
            total -= trow
                .iter()
                .zip(log_probs.iter())
                .map(|(&a, &b)| (a as f64) * b)
                .sum::<f64>();
        }
        return Ok((total / rows as f64) as f32);
    }

    // Hard targets: one index per logits row.
    if targets.len() != rows {
        return Err(EngineError::shape(format!(
            "expected {} class targets, got {}",
            rows,
            targets.len()
        )));
    }
    let t = targets.as_f32()?;
    let mut total = 0.0f64;
    for (row, &target) in data.chunks(classes).zip(t.iter()) {
        let idx = target.round().max(0.0) as usize;
        if idx >= classes {
            return Err(EngineError::shape(format!(
                "class target {idx} out of range {classes}"
            )));
        }
        total -= log_softmax(row)[idx];
    }
    Ok((total / rows as f64) as f32)
}

fn log_softmax(row: &[f32]) -> Vec<f64> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;
    let log_z = row
        .iter()
        .map(|&x| (x as f64 - max).exp())
        .sum::<f64>()
        .ln()
        + max;
    row.iter().map(|&x| x as f64 - log_z).collect()
}

/// Top-1 accuracy of [B, C] predictions against class indices.
pub fn compute_accuracy(predictions: &Tensor, targets: &[usize]) -> Result<f32> {
    let (b, c) = predictions.dims2()?;
    if targets.len() != b {
        return Err(EngineError::shape(format!(
            "expected {} targets, got {}",
            b,
            targets.len()
        )));
    }
    let data = predictions.as_f32()?;
    let mut correct = 0usize;
    for (bi, &target) in targets.iter().enumerate() {
        let row = &data[bi * c..(bi + 1) * c];
        let argmax = row
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        if argmax == target {
            correct += 1;
        }
    }
    Ok(correct as f32 / b as f32)
}

// ============================================================
// Optimizer and schedule
// ============================================================

/// SGD with momentum and decoupled-style weight decay.
pub struct SgdOptimizer {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    velocity: HashMap<String, Vec<f32>>,
    pub step_count: usize,
}

impl SgdOptimizer {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
            step_count: 0,
        }
    }

    pub fn step(
        &mut self,
        store: &mut ParamStore,
        gradients: &HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        self.step_count += 1;
        for (name, grad) in gradients {
            let Some(param) = store.get_param_mut(name) else {
                continue;
            };
            let data = param.as_f32_mut()?;
            if grad.len() != data.len() {
                return Err(EngineError::shape(format!(
                    "gradient length {} does not match parameter `{}` ({})",
                    grad.len(),
                    name,
                    data.len()
                )));
            }
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; data.len()]);
            for i in 0..data.len() {
                let mut g = grad[i];
                if self.weight_decay > 0.0 {
                    g += self.weight_decay * data[i];
                }
                velocity[i] = self.momentum * velocity[i] - self.lr * g;
                data[i] += velocity[i];
            }
        }
        Ok(())
    }
}

/// Linear warmup into cosine decay.
pub struct LrScheduler {
    warmup_steps: usize,
    total_steps: usize,
    min_lr: f32,
    base_lr: f32,
    step_count: usize,
}

impl LrScheduler {
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize, min_lr: f32) -> Self {
        Self {
            warmup_steps,
            total_steps: total_steps.max(1),
            min_lr,
            base_lr,
            step_count: 0,
        }
    }

    pub fn step(&mut self, optimizer: &mut SgdOptimizer) {
        self.step_count += 1;
        let lr = if self.step_count < self.warmup_steps {
            self.base_lr * self.step_count as f32 / self.warmup_steps as f32
        } else {
            let denom = (self.total_steps - self.warmup_steps).max(1) as f32;
            let progress = ((self.step_count - self.warmup_steps) as f32 / denom).min(1.0);
            self.min_lr
                + 0.5 * (self.base_lr - self.min_lr)
                    * (1.0 + (std::f32::consts::PI * progress).cos())
        };
        optimizer.lr = lr;
    }

    pub fn lr(&self, optimizer: &SgdOptimizer) -> f32 {
        optimizer.lr
    }
}

// ============================================================
// Trainer
// ============================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub epochs: usize,
    pub momentum: f32,
    pub weight_decay: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub max_grad_norm: f32,
    /// Loss kind token: cross_entropy | mse | mae.
    pub loss: String,
    /// Sampled indices per parameter for the finite-difference estimate.
    pub grad_samples: usize,
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            epochs: 10,
            momentum: 0.9,
            weight_decay: 0.01,
            warmup_steps: 100,
            total_steps: 10_000,
            max_grad_norm: 1.0,
            loss: "cross_entropy".to_string(),
            grad_samples: 100,
            log_every: 10,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StepMetrics {
    pub loss: f32,
    pub grad_norm: f32,
}

#[derive(Clone, Debug, Default)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub eval_loss: Vec<f32>,
}

pub struct Trainer<'m, M: Model> {
    model: &'m mut M,
    config: TrainingConfig,
    loss_kind: LossKind,
    pub optimizer: SgdOptimizer,
    scheduler: LrScheduler,
    pub global_step: usize,
    pub epoch: usize,
}

impl<'m, M: Model> Trainer<'m, M> {
    pub fn new(model: &'m mut M, config: TrainingConfig) -> Result<Self> {
        let loss_kind = LossKind::parse(&config.loss)?;
        let optimizer = SgdOptimizer::new(
            config.learning_rate,
            config.momentum,
            config.weight_decay,
        );
        let scheduler = LrScheduler::new(
            config.learning_rate,
            config.warmup_steps,
            config.total_steps,
            1e-6,
        );
        Ok(Self {
            model,
            config,
            loss_kind,
            optimizer,
            scheduler,
            global_step: 0,
            epoch: 0,
        })
    }

    pub fn model(&self) -> &M {
        self.model
    }

    fn loss_of(&self, inputs: &Tensor, targets: &Tensor) -> Result<f32> {
        compute_loss(&self.model.forward(inputs)?, targets, self.loss_kind)
    }

    /// Central-difference gradients over a random sample of indices per
    /// parameter. Every perturbed index is restored before returning.
    fn compute_gradients(
        &mut self,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<(f32, HashMap<String, Vec<f32>>)> {
        let base_loss = self.loss_of(inputs, targets)?;
        let names: Vec<String> = self.model.store().params().names().to_vec();

        let mut rng = rand::thread_rng();
        let mut gradients = HashMap::new();

        for name in names {
            let len = self.model.store().param(&name)?.len();
            let mut grad = vec![0.0f32; len];
            let samples = self.config.grad_samples.min(len);
            let indices = rand::seq::index::sample(&mut rng, len, samples);

            for idx in indices {
                let original = self.write_param(&name, idx, |v| v + FD_EPS)?;
                let loss_plus = self.loss_of(inputs, targets)?;
                self.set_param(&name, idx, original - FD_EPS)?;
                let loss_minus = self.loss_of(inputs, targets)?;
                self.set_param(&name, idx, original)?;
                grad[idx] = (loss_plus - loss_minus) / (2.0 * FD_EPS);
            }
            gradients.insert(name, grad);
        }

        Ok((base_loss, gradients))
    }

    fn write_param(&mut self, name: &str, idx: usize, f: impl Fn(f32) -> f32) -> Result<f32> {
        let param = self
            .model
            .store_mut()
            .get_param_mut(name)
            .ok_or_else(|| EngineError::MissingParameter(name.to_string()))?;
        let data = param.as_f32_mut()?;
        let original = data[idx];
        data[idx] = f(original);
        Ok(original)
    }

    fn set_param(&mut self, name: &str, idx: usize, value: f32) -> Result<()> {
        self.write_param(name, idx, |_| value)?;
        Ok(())
    }

    /// One gradient step with global-norm clipping.
    pub fn train_step(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<StepMetrics> {
        let (loss, mut gradients) = self.compute_gradients(inputs, targets)?;

        let mut total_norm = 0.0f32;
        for grad in gradients.values() {
            total_norm += grad.iter().map(|&g| g * g).sum::<f32>();
        }
        total_norm = total_norm.sqrt();
        if total_norm > self.config.max_grad_norm {
            let scale = self.config.max_grad_norm / total_norm;
            for grad in gradients.values_mut() {
                for g in grad.iter_mut() {
                    *g *= scale;
                }
            }
        }

        self.optimizer.step(self.model.store_mut(), &gradients)?;
        self.scheduler.step(&mut self.optimizer);
        self.global_step += 1;

        Ok(StepMetrics {
            loss,
            grad_norm: total_norm,
        })
    }

    pub fn train_epoch(&mut self, batches: &[(Tensor, Tensor)]) -> Result<f32> {
        self.model.store_mut().state = ModelState::Training;
        let mut epoch_loss = 0.0f32;
        for (inputs, targets) in batches {
            let metrics = self.train_step(inputs, targets)?;
            epoch_loss += metrics.loss;
            if self.config.log_every > 0 && self.global_step % self.config.log_every == 0 {
                tracing::info!(
                    "step {} loss {:.4} grad_norm {:.4} lr {:.6}",
                    self.global_step,
                    metrics.loss,
                    metrics.grad_norm,
                    self.optimizer.lr
                );
            }
        }
        self.epoch += 1;
        Ok(epoch_loss / batches.len().max(1) as f32)
    }

    pub fn evaluate(&self, batches: &[(Tensor, Tensor)]) -> Result<f32> {
        let mut total = 0.0f32;
        for (inputs, targets) in batches {
            total += self.loss_of(inputs, targets)?;
        }
        Ok(total / batches.len().max(1) as f32)
    }

    /// Full loop; the model ends in the `Trained` state.
    pub fn train(
        &mut self,
        train_batches: &[(Tensor, Tensor)],
        eval_batches: Option<&[(Tensor, Tensor)]>,
    ) -> Result<TrainingHistory> {
        tracing::info!("starting training for {} epochs", self.config.epochs);
        let mut history = TrainingHistory::default();
        for _ in 0..self.config.epochs {
            history.train_loss.push(self.train_epoch(train_batches)?);
            if let Some(eval) = eval_batches {
                history.eval_loss.push(self.evaluate(eval)?);
            }
        }
        self.model.store_mut().state = ModelState::Trained;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classifier, ClassifierConfig};

    fn tiny_classifier() -> Classifier {
        Classifier::new(ClassifierConfig {
            input_dim: 2,
            hidden_dims: vec![],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap()
    }

    fn config() -> TrainingConfig {
        TrainingConfig {
            learning_rate: 0.05,
            epochs: 2,
            momentum: 0.0,
            weight_decay: 0.0,
            warmup_steps: 0,
            total_steps: 100_000,
            max_grad_norm: 10.0,
            loss: "mse".to_string(),
            grad_samples: 100,
            log_every: 0,
        }
    }

    #[test]
    fn unknown_loss_is_config_error() {
        assert!(matches!(
            LossKind::parse("hinge"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn cross_entropy_of_confident_correct_logits_is_small() {
        let logits = Tensor::from_vec(vec![10.0, -10.0, -10.0, 10.0], &[2, 2]).unwrap();
        let targets = Tensor::from_vec(vec![0.0, 1.0], &[2]).unwrap();
        let loss = compute_loss(&logits, &targets, LossKind::CrossEntropy).unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn mse_shape_mismatch_is_shape_error() {
        let a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[2, 3]);
        assert!(matches!(
            compute_loss(&a, &b, LossKind::Mse),
            Err(EngineError::Shape(_))
        ));
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let preds = Tensor::from_vec(vec![0.9, 0.1, 0.2, 0.8], &[2, 2]).unwrap();
        assert_eq!(compute_accuracy(&preds, &[0, 1]).unwrap(), 1.0);
        assert_eq!(compute_accuracy(&preds, &[1, 1]).unwrap(), 0.5);
    }

    #[test]
    fn finite_difference_drives_loss_down() {
        let mut model = tiny_classifier();
        let mut trainer = Trainer::new(&mut model, config()).unwrap();

        let inputs = Tensor::from_vec(vec![1.0, -1.0, -1.0, 1.0], &[2, 2]).unwrap();
        let targets = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();

        let initial = trainer.loss_of(&inputs, &targets).unwrap();
        for _ in 0..25 {
            trainer.train_step(&inputs, &targets).unwrap();
        }
        let final_loss = trainer.loss_of(&inputs, &targets).unwrap();
        assert!(
            final_loss < initial,
            "loss did not decrease: {initial} -> {final_loss}"
        );
    }

    #[test]
    fn gradient_step_restores_untouched_state() {
        let mut model = tiny_classifier();
        let before: Vec<Vec<f32>> = model
            .store()
            .params()
            .iter()
            .map(|(_, t)| t.as_f32().unwrap().to_vec())
            .collect();

        let cfg = TrainingConfig {
            learning_rate: 0.0, // zero step isolates the perturbation logic
            ..config()
        };
        let mut trainer = Trainer::new(&mut model, cfg).unwrap();
        let inputs = Tensor::from_vec(vec![1.0, -1.0], &[1, 2]).unwrap();
        let targets = Tensor::from_vec(vec![1.0, 0.0], &[1, 2]).unwrap();
        trainer.train_step(&inputs, &targets).unwrap();

        let after: Vec<Vec<f32>> = model
            .store()
            .params()
            .iter()
            .map(|(_, t)| t.as_f32().unwrap().to_vec())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn train_transitions_to_trained() {
        let mut model = tiny_classifier();
        let mut trainer = Trainer::new(
            &mut model,
            TrainingConfig {
                epochs: 1,
                ..config()
            },
        )
        .unwrap();

        let inputs = Tensor::from_vec(vec![1.0, -1.0], &[1, 2]).unwrap();
        let targets = Tensor::from_vec(vec![1.0, 0.0], &[1, 2]).unwrap();
        let history = trainer
            .train(&[(inputs, targets)], None)
            .unwrap();
        assert_eq!(history.train_loss.len(), 1);
        assert_eq!(model.store().state, ModelState::Trained);
    }
}

//! Device-aware inference facade.
//!
//! A predictor borrows its model, records latency statistics, and — when an
//! ONNX artifact is configured and the runtime is available — delegates the
//! forward pass to the session instead of the native path. A missing
//! runtime is never an error: the native path takes over with a log line.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::device::{self, DeviceInfo, MemoryTracker};
use crate::error::{EngineError, Result};
use crate::models::Model;
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct PredictorConfig {
    /// Device preference token: auto | cpu | cuda | metal | wasm.
    pub device: String,
    pub max_batch_size: usize,
    /// Default deadline for scheduler-mediated submissions, in ms.
    pub timeout_ms: u64,
    /// Try ONNX delegation when an artifact is set.
    pub use_onnx: bool,
    pub onnx_artifact: Option<PathBuf>,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            max_batch_size: 32,
            timeout_ms: 30_000,
            use_onnx: true,
            onnx_artifact: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PredictorStats {
    pub inference_count: u64,
    pub total_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub device: String,
    pub memory_allocated: u64,
    pub memory_peak: u64,
}

#[derive(Default)]
struct Counters {
    inference_count: u64,
    total_latency_ms: f64,
}

pub struct Predictor<'m, M: Model + ?Sized> {
    model: &'m M,
    config: PredictorConfig,
    device: DeviceInfo,
    counters: Mutex<Counters>,
    memory: Mutex<MemoryTracker>,
    #[cfg(feature = "onnx")]
    session: Option<crate::onnx::OnnxPredictor>,
}

impl<'m, M: Model + ?Sized> Predictor<'m, M> {
    pub fn new(model: &'m M, config: PredictorConfig) -> Self {
        let device = device::select(&config.device);
        let device_string = device.device_string();
        tracing::info!("predictor using device: {}", device_string);

        #[cfg(feature = "onnx")]
        let session = if config.use_onnx {
            config.onnx_artifact.as_deref().and_then(|path| {
                match crate::onnx::OnnxPredictor::load(path, &device_string) {
                    Ok(session) => {
                        tracing::info!("ONNX session loaded from {:?}", path);
                        Some(session)
                    }
                    Err(e) => {
                        // Delegation unavailable: fall back silently.
                        tracing::info!("ONNX unavailable ({}), using native path", e);
                        None
                    }
                }
            })
        } else {
            None
        };

        #[cfg(not(feature = "onnx"))]
        if config.use_onnx && config.onnx_artifact.is_some() {
            tracing::info!("ONNX feature not compiled in, using native path");
        }

        Self {
            model,
            config,
            memory: Mutex::new(MemoryTracker::new(device_string)),
            device,
            counters: Mutex::new(Counters::default()),
            #[cfg(feature = "onnx")]
            session,
        }
    }

    /// Load an artifact into the model, then wrap it.
    pub fn from_artifact(model: &'m mut M, base: &Path, config: PredictorConfig) -> Result<Self> {
        model.load(base)?;
        Ok(Self::new(model, config))
    }

    pub fn model(&self) -> &M {
        self.model
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn run_forward(&self, inputs: &Tensor) -> Result<Tensor> {
        #[cfg(feature = "onnx")]
        if let Some(session) = &self.session {
            match session.predict(inputs) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    tracing::warn!("ONNX session failed ({}), falling back to native", e);
                }
            }
        }
        self.model.forward(inputs)
    }

    /// Run inference on one batch. Rank-1 input gets a leading batch axis.
    pub fn predict(&self, inputs: &Tensor) -> Result<Tensor> {
        let batched;
        let inputs = if inputs.rank() == 1 {
            batched = inputs.reshape(&[1, inputs.len()])?;
            &batched
        } else {
            inputs
        };

        let start = Instant::now();
        let outputs = self.run_forward(inputs)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut counters = self.counters.lock().expect("stats lock poisoned");
        counters.inference_count += 1;
        counters.total_latency_ms += latency_ms;
        if counters.inference_count % 100 == 0 {
            tracing::debug!(
                "inference stats: count={}, avg_latency={:.2}ms",
                counters.inference_count,
                counters.total_latency_ms / counters.inference_count as f64
            );
        }

        Ok(outputs)
    }

    /// Stack a list of equal-shaped inputs into one batch and predict.
    pub fn predict_many(&self, inputs: &[Tensor]) -> Result<Tensor> {
        self.predict(&Tensor::stack(inputs)?)
    }

    /// Chunked batch prediction, order preserving. The effective chunk size
    /// is the smaller of the configured and the requested one.
    pub fn predict_batch(
        &self,
        batch: &[Tensor],
        batch_size: Option<usize>,
    ) -> Result<Vec<Tensor>> {
        let chunk_size = batch_size
            .map(|req| req.min(self.config.max_batch_size))
            .unwrap_or(self.config.max_batch_size)
            .max(1);

        let mut results = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(chunk_size) {
            let outputs = self.predict(&Tensor::stack(chunk)?)?;
            for i in 0..chunk.len() {
                results.push(outputs.index_axis0(i)?);
            }
        }
        Ok(results)
    }

    /// Prime caches and allocator with zero inputs; counts toward stats.
    pub fn warmup(&self, iterations: usize) -> Result<()> {
        tracing::info!("running warmup ({} iterations)", iterations);
        let mut shape = vec![1];
        shape.extend(self.model.input_shape());
        let dummy = Tensor::zeros(&shape);
        for _ in 0..iterations {
            self.predict(&dummy)?;
        }
        Ok(())
    }

    pub fn get_stats(&self) -> PredictorStats {
        let counters = self.counters.lock().expect("stats lock poisoned");
        let memory = self.memory.lock().expect("memory lock poisoned").stats();
        let avg = if counters.inference_count > 0 {
            counters.total_latency_ms / counters.inference_count as f64
        } else {
            0.0
        };
        PredictorStats {
            inference_count: counters.inference_count,
            total_latency_ms: counters.total_latency_ms,
            avg_latency_ms: avg,
            device: self.device.device_string(),
            memory_allocated: memory.allocated,
            memory_peak: memory.peak,
        }
    }

    pub fn reset_stats(&self) {
        let mut counters = self.counters.lock().expect("stats lock poisoned");
        counters.inference_count = 0;
        counters.total_latency_ms = 0.0;
    }
}

/// Streaming variant for token-by-token generation over any model whose
/// forward returns [B, T, vocab] logits.
pub struct StreamingPredictor<'m, M: Model + ?Sized> {
    inner: Predictor<'m, M>,
}

impl<'m, M: Model + ?Sized> StreamingPredictor<'m, M> {
    pub fn new(model: &'m M, config: PredictorConfig) -> Self {
        Self {
            inner: Predictor::new(model, config),
        }
    }

    pub fn predictor(&self) -> &Predictor<'m, M> {
        &self.inner
    }

    /// Single-step prediction over the current token window.
    pub fn predict_step(&self, tokens: &[u32]) -> Result<Tensor> {
        let data: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        self.inner.predict(&Tensor::from_vec(data, &[1, tokens.len()])?)
    }

    /// Greedy generation that invokes `callback` with each new token.
    pub fn stream_generate(
        &self,
        prompt: &[u32],
        max_tokens: usize,
        mut callback: Option<&mut dyn FnMut(u32)>,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(EngineError::shape("empty prompt".to_string()));
        }
        let mut generated = prompt.to_vec();

        for _ in 0..max_tokens {
            let logits = self.predict_step(&generated)?;
            let (_, t, v) = logits.dims3()?;
            let data = logits.as_f32()?;
            let last = &data[(t - 1) * v..t * v];
            let next = last
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i as u32)
                .unwrap_or(0);
            generated.push(next);
            if let Some(cb) = callback.as_mut() {
                cb(next);
            }
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classifier, ClassifierConfig, TextGenerator, TextGeneratorConfig};

    fn classifier() -> Classifier {
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
    fn predict_adds_batch_axis_and_counts() {
        let model = classifier();
        let predictor = Predictor::new(&model, PredictorConfig::default());
        let out = predictor.predict(&Tensor::zeros(&[8])).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(predictor.get_stats().inference_count, 1);
    }

    #[test]
    fn predict_batch_preserves_order() {
        let model = classifier();
        let predictor = Predictor::new(&model, PredictorConfig::default());

        let mut rng = rand::thread_rng();
        let inputs: Vec<Tensor> = (0..7).map(|_| Tensor::randn(&[8], 1.0, &mut rng)).collect();
        let chunked = predictor.predict_batch(&inputs, Some(3)).unwrap();
        assert_eq!(chunked.len(), 7);

        for (input, out) in inputs.iter().zip(chunked.iter()) {
            let single = predictor.predict(input).unwrap().index_axis0(0).unwrap();
            for (a, b) in out
                .as_f32()
                .unwrap()
                .iter()
                .zip(single.as_f32().unwrap().iter())
            {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn warmup_counts_toward_stats() {
        let model = classifier();
        let predictor = Predictor::new(&model, PredictorConfig::default());
        predictor.warmup(3).unwrap();
        let stats = predictor.get_stats();
        assert_eq!(stats.inference_count, 3);
        assert!(stats.total_latency_ms >= 0.0);

        predictor.reset_stats();
        assert_eq!(predictor.get_stats().inference_count, 0);
    }

    #[test]
    fn stream_generate_invokes_callback_per_token() {
        let model = TextGenerator::new(TextGeneratorConfig {
            vocab_size: 40,
            hidden_size: 16,
            num_layers: 1,
            max_length: 32,
        })
        .unwrap();
        let streaming = StreamingPredictor::new(&model, PredictorConfig::default());

        let mut seen = Vec::new();
        let mut cb = |t: u32| seen.push(t);
        let out = streaming.stream_generate(&[1, 2], 4, Some(&mut cb)).unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(seen.len(), 4);
        assert_eq!(&out[2..], seen.as_slice());
    }
}

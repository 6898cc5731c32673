//! ONNX Runtime delegation (behind the `onnx` feature).
//!
//! When a serialized ONNX artifact exists, a session replaces the native
//! forward path. Provider selection follows the device preference; a
//! missing runtime or artifact is absorbed by the caller, not raised.

use std::path::Path;
use std::time::Instant;

use ort::GraphOptimizationLevel;

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;

/// Advisory latency figures from [`OnnxPredictor::benchmark`].
#[derive(Clone, Debug, Default)]
pub struct BenchmarkReport {
    pub mean_latency_ms: f64,
    pub std_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throughput_samples_per_sec: f64,
}

pub struct OnnxPredictor {
    session: ort::Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxPredictor {
    /// Build a session for the artifact. `device` is a canonical device
    /// string; CUDA devices get the GPU provider chain when the build has
    /// it, everything else runs on the CPU provider.
    pub fn load(path: &Path, device: &str) -> Result<Self> {
        if !path.exists() {
            return Err(EngineError::Delegation(format!(
                "ONNX artifact not found: {path:?}"
            )));
        }

        let builder = ort::Session::builder()
            .map_err(|e| EngineError::Delegation(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EngineError::Delegation(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| EngineError::Delegation(e.to_string()))?;

        if device.starts_with("cuda") {
            tracing::info!("requesting GPU providers for {}", device);
        }

        let session = builder
            .commit_from_file(path)
            .map_err(|e| EngineError::Delegation(e.to_string()))?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();
        tracing::info!(
            "ONNX model loaded: inputs={:?}, outputs={:?}",
            input_names,
            output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Feed the tensor as the session's first input; return the first output.
    pub fn predict(&self, inputs: &Tensor) -> Result<Tensor> {
        let name = self
            .input_names
            .first()
            .ok_or_else(|| EngineError::Delegation("session has no inputs".to_string()))?
            .clone();

        let shape: Vec<usize> = inputs.shape().to_vec();
        let value = ort::value::Tensor::from_array((shape, inputs.as_f32()?.to_vec()))
            .map_err(|e| EngineError::Delegation(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![name.as_str() => value]
                .map_err(|e| EngineError::Delegation(e.to_string()))?)
            .map_err(|e| EngineError::Delegation(e.to_string()))?;

        let (out_shape, data) = outputs[0]
            .try_extract_raw_tensor::<f32>()
            .map_err(|e| EngineError::Delegation(e.to_string()))?;
        let out_shape: Vec<usize> = out_shape.iter().map(|&d| d as usize).collect();
        Tensor::from_vec(data.to_vec(), &out_shape)
    }

    /// Latency distribution over `iterations` runs of a zero input.
    pub fn benchmark(
        &self,
        input_shape: &[usize],
        iterations: usize,
        warmup: usize,
    ) -> Result<BenchmarkReport> {
        let dummy = Tensor::zeros(input_shape);
        for _ in 0..warmup {
            self.predict(&dummy)?;
        }

        let mut latencies = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            let start = Instant::now();
            self.predict(&dummy)?;
            latencies.push(start.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(summarize_latencies(&latencies))
    }
}

fn summarize_latencies(latencies: &[f64]) -> BenchmarkReport {
    if latencies.is_empty() {
        return BenchmarkReport::default();
    }
    let n = latencies.len() as f64;
    let mean = latencies.iter().sum::<f64>() / n;
    let var = latencies.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / n;

    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pct = |p: f64| sorted[(((sorted.len() - 1) as f64) * p).round() as usize];

    BenchmarkReport {
        mean_latency_ms: mean,
        std_latency_ms: var.sqrt(),
        min_latency_ms: sorted[0],
        max_latency_ms: sorted[sorted.len() - 1],
        p50_latency_ms: pct(0.50),
        p95_latency_ms: pct(0.95),
        p99_latency_ms: pct(0.99),
        throughput_samples_per_sec: if mean > 0.0 { 1000.0 / mean } else { 0.0 },
    }
}

//! The model family.
//!
//! Every architecture is a deterministic computation over its parameter
//! store: no hidden mutation during forward, which is what makes concurrent
//! inference on a shared model sound.

pub mod classifier;
pub mod compressor;
pub mod encoder;
pub mod generator;
pub mod transformer;

use std::path::Path;

use crate::error::{EngineError, Result};
use crate::params::{ModelMetadata, ParamStore};
use crate::quant::{quantize_store, QuantMode};
use crate::tensor::Tensor;

pub use classifier::{Classifier, ClassifierConfig};
pub use compressor::{
    recommend_algorithm, CompressionHints, LstmState, NeuralCompressor, NeuralCompressorConfig,
};
pub use encoder::{SemanticEncoder, SemanticEncoderConfig};
pub use generator::{GenerateOptions, TextGenerator, TextGeneratorConfig};
pub use transformer::{TransformerConfig, TransformerLite};

/// Variant tag for callers that branch on architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Transformer,
    Compressor,
    Encoder,
    Classifier,
    Generator,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Transformer => "transformer",
            ModelKind::Compressor => "compressor",
            ModelKind::Encoder => "encoder",
            ModelKind::Classifier => "classifier",
            ModelKind::Generator => "generator",
        }
    }
}

/// Capability surface shared by the whole family. The typed entry points
/// (encode, predict_next_byte, generate, ...) live on the concrete types.
pub trait Model {
    fn kind(&self) -> ModelKind;
    fn store(&self) -> &ParamStore;
    fn store_mut(&mut self) -> &mut ParamStore;

    /// Expected input shape without the batch axis.
    fn input_shape(&self) -> Vec<usize>;

    /// Expected output shape without the batch axis.
    fn output_shape(&self) -> Vec<usize>;

    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    fn num_parameters(&self) -> usize {
        self.store().num_parameters()
    }

    fn metadata(&self) -> ModelMetadata {
        let store = self.store();
        ModelMetadata {
            name: store.name.clone(),
            version: store.version.clone(),
            architecture: store.architecture.clone(),
            input_shape: self.input_shape(),
            output_shape: self.output_shape(),
            parameters: store.num_parameters(),
            device: store.device.clone(),
            quantization: store.quantization.clone(),
            extra: store.extra.clone(),
        }
    }

    fn summary(&self) -> String {
        self.store()
            .summary(&self.input_shape(), &self.output_shape())
    }

    /// Write the paired weights blob + metadata sidecar.
    fn save(&self, base: &Path) -> Result<()> {
        self.store().save(base, &self.metadata())
    }

    /// Load a saved artifact in place; the state becomes `Trained`.
    fn load(&mut self, base: &Path) -> Result<()> {
        self.store_mut().load(base)?;
        Ok(())
    }

    /// Quantize every parameter in place. `mode` is `fp16|int8|int4`;
    /// unknown modes are a config error.
    fn quantize(&mut self, mode: &str) -> Result<()> {
        let mode = QuantMode::parse(mode)?;
        quantize_store(self.store_mut(), mode, true)
    }

    /// Restore quantized parameters to f32 so the forward path can run.
    fn dequantize(&mut self) -> Result<()> {
        crate::quant::dequantize_store(self.store_mut())
    }

    /// Record the model's target device. Requires exclusive access, like
    /// every other mutation of the store.
    fn to_device(&mut self, device: &str) -> Result<()> {
        crate::device::validate_device_string(device)?;
        self.store_mut().device = device.to_string();
        Ok(())
    }
}

/// Interpret a rank-1 or rank-2 f32 tensor as batched token ids. Models that
/// consume ids accept them through the uniform `forward(Tensor)` surface.
pub fn tensor_to_ids(input: &Tensor) -> Result<Vec<Vec<u32>>> {
    let (rows, cols) = match input.rank() {
        1 => (1, input.shape()[0]),
        2 => (input.shape()[0], input.shape()[1]),
        r => {
            return Err(EngineError::shape(format!(
                "token input must be rank 1 or 2, got rank {r}"
            )))
        }
    };
    let data = input.as_f32()?;
    let mut out = Vec::with_capacity(rows);
    for r in 0..rows {
        out.push(
            data[r * cols..(r + 1) * cols]
                .iter()
                .map(|&v| v.round().max(0.0) as u32)
                .collect(),
        );
    }
    Ok(out)
}

/// Validate that every row of a batch has the same length `t <= max_len`.
pub(crate) fn check_batch(ids: &[Vec<u32>], max_len: usize) -> Result<(usize, usize)> {
    let b = ids.len();
    if b == 0 {
        return Err(EngineError::shape("empty batch".to_string()));
    }
    let t = ids[0].len();
    if t == 0 {
        return Err(EngineError::shape("empty sequence".to_string()));
    }
    if ids.iter().any(|row| row.len() != t) {
        return Err(EngineError::shape(
            "ragged batch: rows differ in length".to_string(),
        ));
    }
    if t > max_len {
        return Err(EngineError::shape(format!(
            "sequence length {t} exceeds maximum {max_len}"
        )));
    }
    Ok((b, t))
}

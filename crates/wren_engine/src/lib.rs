//! Wren Engine
//!
//! Portable neural-inference and neural-compression runtime on a
//! hand-written tensor/parameter model: a small model family (transformer
//! encoder, LSTM byte predictor, semantic encoder, classifier, generator),
//! a device-aware predictor with dynamic batching, quantization, portable
//! exports, and the compression/search application layer built on top.

pub mod batch;
pub mod compress;
pub mod device;
pub mod error;
pub mod export;
pub mod index;
pub mod models;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod params;
pub mod predictor;
pub mod quant;
pub mod tensor;
pub mod tokenizer;
pub mod train;

// Primary public API re-exports
pub use batch::{BatchProcessor, BatchProcessorConfig, BatchRequest, BatchResponse};
pub use compress::{CompressionAnalyzer, CompressionReport, NeuralEntropyEstimator};
pub use device::{DeviceInfo, DeviceType};
pub use error::{EngineError, Result};
pub use models::{
    Classifier, ClassifierConfig, GenerateOptions, Model, ModelKind, NeuralCompressor,
    NeuralCompressorConfig, SemanticEncoder, SemanticEncoderConfig, TextGenerator,
    TextGeneratorConfig, TransformerConfig, TransformerLite,
};
pub use params::{ModelMetadata, ModelState, ParamStore};
pub use predictor::{Predictor, PredictorConfig, StreamingPredictor};
pub use quant::{dequantize_tensor, quantize_tensor, QuantMode, QuantParams};
pub use tensor::{Dtype, Tensor};

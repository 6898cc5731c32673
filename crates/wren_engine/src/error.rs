//! Error taxonomy for the engine.
//!
//! Every expected failure maps to a specific variant; panics are reserved
//! for programmer errors in tests. Optional-runtime misses (ONNX, GPU) are
//! absorbed at the fallback site and never surfaced through this enum.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown pooling / quantization mode / loss kind / device token.
    #[error("config error: {0}")]
    Config(String),

    /// Wrong rank or extent for an operation, or a load-time shape mismatch.
    #[error("shape error: {0}")]
    Shape(String),

    /// A parameter required by the architecture is absent from the store.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// Divisor underflow or non-finite result that epsilon guards cannot fix.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// A scheduler submit exceeded its deadline. `submit` itself returns
    /// `None` instead of raising; this variant exists for internal plumbing.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Delegated runtime (ONNX session) failed after it was selected.
    #[error("delegation error: {0}")]
    Delegation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        EngineError::Shape(msg.into())
    }

    pub fn numeric(msg: impl Into<String>) -> Self {
        EngineError::Numeric(msg.into())
    }
}

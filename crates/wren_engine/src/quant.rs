//! Per-tensor quantization: fp16 cast, int8 symmetric/asymmetric min-max,
//! int4 symmetric. Sidecar scale and zero-point values are stored as
//! buffers under derived names so they survive save/load unchanged.

use half::f16;

use crate::error::{EngineError, Result};
use crate::params::ParamStore;
use crate::tensor::{Dtype, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantMode {
    Fp16,
    Int8,
    Int4,
}

impl QuantMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fp16" | "float16" => Ok(QuantMode::Fp16),
            "int8" => Ok(QuantMode::Int8),
            "int4" => Ok(QuantMode::Int4),
            other => Err(EngineError::config(format!(
                "unknown quantization mode: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantMode::Fp16 => "fp16",
            QuantMode::Int8 => "int8",
            QuantMode::Int4 => "int4",
        }
    }
}

/// Per-tensor quantization parameters. `zero_point` is only nonzero for
/// asymmetric int8.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i8,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Quantize one tensor. fp16 is a cast; int8/int4 are min-max affine maps.
pub fn quantize_tensor(
    tensor: &Tensor,
    mode: QuantMode,
    symmetric: bool,
) -> Result<(Tensor, QuantParams)> {
    let data = tensor.as_f32()?;
    match mode {
        QuantMode::Fp16 => {
            let cast: Vec<f16> = data.iter().map(|&v| f16::from_f32(v)).collect();
            Ok((
                Tensor::from_f16(cast, tensor.shape())?,
                QuantParams::default(),
            ))
        }
        QuantMode::Int8 => {
            if symmetric {
                let max_abs = data.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
                let mut scale = max_abs / 127.0;
                if scale == 0.0 {
                    scale = 1.0;
                }
                let q: Vec<i8> = data
                    .iter()
                    .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
                    .collect();
                Ok((
                    Tensor::from_i8(q, tensor.shape())?,
                    QuantParams {
                        scale,
                        zero_point: 0,
                    },
                ))
            } else {
                let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
                let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut scale = (max - min) / 255.0;
                if scale == 0.0 || !scale.is_finite() {
                    scale = 1.0;
                }
                let zero_point = (-min / scale).round().clamp(-128.0, 127.0) as i8;
                let q: Vec<i8> = data
                    .iter()
                    .map(|&v| {
                        ((v / scale).round() + zero_point as f32).clamp(-128.0, 127.0) as i8
                    })
                    .collect();
                Ok((
                    Tensor::from_i8(q, tensor.shape())?,
                    QuantParams { scale, zero_point },
                ))
            }
        }
        QuantMode::Int4 => {
            let max_abs = data.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
            let mut scale = max_abs / 7.0;
            if scale == 0.0 {
                scale = 1.0;
            }
            let q: Vec<i8> = data
                .iter()
                .map(|&v| (v / scale).round().clamp(-8.0, 7.0) as i8)
                .collect();
            Ok((
                Tensor::from_i8(q, tensor.shape())?,
                QuantParams {
                    scale,
                    zero_point: 0,
                },
            ))
        }
    }
}

/// Invert [`quantize_tensor`]. fp16 promotes back to f32.
pub fn dequantize_tensor(
    quantized: &Tensor,
    params: &QuantParams,
    mode: QuantMode,
) -> Result<Tensor> {
    match mode {
        QuantMode::Fp16 => {
            let data: Vec<f32> = quantized.as_f16()?.iter().map(|v| v.to_f32()).collect();
            Tensor::from_vec(data, quantized.shape())
        }
        QuantMode::Int8 | QuantMode::Int4 => {
            let data: Vec<f32> = quantized
                .as_i8()?
                .iter()
                .map(|&v| (v as f32 - params.zero_point as f32) * params.scale)
                .collect();
            Tensor::from_vec(data, quantized.shape())
        }
    }
}

/// Quantize every f32 parameter of a store in place. Scale and zero-point
/// sidecars land in the buffer map as `"{name}_scale"` / `"{name}_zero"`;
/// the store's quantization tag switches to the mode.
pub fn quantize_store(store: &mut ParamStore, mode: QuantMode, symmetric: bool) -> Result<()> {
    let names: Vec<String> = store.params().names().to_vec();

    let mut original_bytes = 0usize;
    let mut quantized_bytes = 0usize;

    for name in names {
        let tensor = store.param(&name)?;
        if tensor.dtype() != Dtype::F32 {
            continue;
        }
        original_bytes += tensor.byte_len();

        let (quantized, params) = quantize_tensor(tensor, mode, symmetric)?;
        quantized_bytes += quantized.byte_len();
        store.set_param(name.clone(), quantized);

        if mode != QuantMode::Fp16 {
            store.set_buffer(
                format!("{name}_scale"),
                Tensor::from_vec(vec![params.scale], &[1])?,
            );
            if !symmetric {
                store.set_buffer(
                    format!("{name}_zero"),
                    Tensor::from_i8(vec![params.zero_point], &[1])?,
                );
            }
        }
    }

    store.quantization = mode.as_str().to_string();
    let ratio = if quantized_bytes > 0 {
        original_bytes as f64 / quantized_bytes as f64
    } else {
        1.0
    };
    tracing::info!(
        "quantized {} -> {} bytes ({:.2}x) mode={}",
        original_bytes,
        quantized_bytes,
        ratio,
        mode.as_str()
    );
    Ok(())
}

/// Restore every quantized parameter of a store to f32 using the sidecar
/// buffers, which are removed afterwards. The tag returns to `fp32`.
/// Inverse of [`quantize_store`] up to quantization error.
pub fn dequantize_store(store: &mut ParamStore) -> Result<()> {
    if store.quantization == "fp32" {
        return Ok(());
    }
    let mode = QuantMode::parse(&store.quantization)?;
    let names: Vec<String> = store.params().names().to_vec();

    for name in names {
        let tensor = store.param(&name)?;
        if tensor.dtype() == Dtype::F32 {
            continue;
        }
        let params = stored_quant_params(store, &name);
        let restored = dequantize_tensor(store.param(&name)?, &params, mode)?;
        store.set_param(name.clone(), restored);
        store.buffers_mut().remove(&format!("{name}_scale"));
        store.buffers_mut().remove(&format!("{name}_zero"));
    }

    store.quantization = "fp32".to_string();
    Ok(())
}

/// Read the sidecar quantization params for a parameter back out of the
/// buffer map.
pub fn stored_quant_params(store: &ParamStore, name: &str) -> QuantParams {
    let scale = store
        .get_buffer(&format!("{name}_scale"))
        .and_then(|t| t.as_f32().ok().map(|d| d[0]))
        .unwrap_or(1.0);
    let zero_point = store
        .get_buffer(&format!("{name}_zero"))
        .and_then(|t| t.as_i8().ok().map(|d| d[0]))
        .unwrap_or(0);
    QuantParams { scale, zero_point }
}

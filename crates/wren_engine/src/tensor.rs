//! Dense tensor type and the deterministic operators the model family is
//! built from.
//!
//! Tensors are values: every operator returns a fresh tensor and never
//! touches hidden state. Math is defined on f32 storage; f16/i8 storage
//! exists only to hold quantized parameters and round-trips through the
//! serializer.

use half::f16;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::error::{EngineError, Result};

/// Epsilon for layer normalization.
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Epsilon for L2 normalization.
pub const L2_NORM_EPS: f32 = 1e-8;

/// sqrt(2 / pi), used by the tanh GELU approximation.
const GELU_COEF: f32 = 0.797_884_56;

// ============================================================
// Storage
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F16,
    I8,
}

impl Dtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::F16 => "f16",
            Dtype::I8 => "i8",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "f32" | "float32" => Ok(Dtype::F32),
            "f16" | "float16" => Ok(Dtype::F16),
            "i8" | "int8" | "int4" => Ok(Dtype::I8),
            other => Err(EngineError::config(format!("unknown dtype: {other}"))),
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F16 => 2,
            Dtype::I8 => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::I8(v) => v.len(),
        }
    }
}

// ============================================================
// Tensor
// ============================================================

#[derive(Clone, Debug)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let expect: usize = shape.iter().product();
        if data.len() != expect {
            return Err(EngineError::shape(format!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::F32(data),
        })
    }

    pub fn from_f16(data: Vec<f16>, shape: &[usize]) -> Result<Self> {
        let expect: usize = shape.iter().product();
        if data.len() != expect {
            return Err(EngineError::shape(format!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::F16(data),
        })
    }

    pub fn from_i8(data: Vec<i8>, shape: &[usize]) -> Result<Self> {
        let expect: usize = shape.iter().product();
        if data.len() != expect {
            return Err(EngineError::shape(format!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::I8(data),
        })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    pub fn ones(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: TensorData::F32(vec![1.0; len]),
        }
    }

    /// Gaussian init scaled by `std`, used by every constructor.
    pub fn randn<R: Rng>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let len = shape.iter().product();
        let data = (0..len)
            .map(|_| {
                let v: f32 = rng.sample(StandardNormal);
                v * std
            })
            .collect();
        Self {
            shape: shape.to_vec(),
            data: TensorData::F32(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match &self.data {
            TensorData::F32(_) => Dtype::F32,
            TensorData::F16(_) => Dtype::F16,
            TensorData::I8(_) => Dtype::I8,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(EngineError::config(format!(
                "operation requires f32 storage, tensor is {:?}; dequantize first",
                match other {
                    TensorData::F16(_) => Dtype::F16,
                    _ => Dtype::I8,
                }
            ))),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Ok(v),
            _ => Err(EngineError::config(
                "operation requires f32 storage; dequantize first".to_string(),
            )),
        }
    }

    pub fn as_f16(&self) -> Result<&[f16]> {
        match &self.data {
            TensorData::F16(v) => Ok(v),
            _ => Err(EngineError::config("tensor is not f16".to_string())),
        }
    }

    pub fn as_i8(&self) -> Result<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Ok(v),
            _ => Err(EngineError::config("tensor is not i8".to_string())),
        }
    }

    /// Copy out as f32 regardless of storage (f16 widens, i8 is a raw cast
    /// without scale application).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let expect: usize = shape.iter().product();
        if expect != self.len() {
            return Err(EngineError::shape(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        let mut out = self.clone();
        out.shape = shape.to_vec();
        Ok(out)
    }

    /// Slice along the leading axis; returns row `i` with that axis dropped.
    pub fn index_axis0(&self, i: usize) -> Result<Tensor> {
        if self.rank() < 1 || i >= self.shape[0] {
            return Err(EngineError::shape(format!(
                "index {} out of range for shape {:?}",
                i, self.shape
            )));
        }
        let row_len: usize = self.shape[1..].iter().product::<usize>().max(1);
        let data = self.as_f32()?;
        Tensor::from_vec(
            data[i * row_len..(i + 1) * row_len].to_vec(),
            &self.shape[1..],
        )
    }

    /// Stack equal-shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| EngineError::shape("cannot stack zero tensors".to_string()))?;
        let mut data = Vec::with_capacity(first.len() * tensors.len());
        for t in tensors {
            if t.shape() != first.shape() {
                return Err(EngineError::shape(format!(
                    "stack shape mismatch: {:?} vs {:?}",
                    t.shape(),
                    first.shape()
                )));
            }
            data.extend_from_slice(t.as_f32()?);
        }
        let mut shape = vec![tensors.len()];
        shape.extend_from_slice(first.shape());
        Tensor::from_vec(data, &shape)
    }

    // ============================================================
    // Elementwise
    // ============================================================

    fn map(&self, f: impl Fn(f32) -> f32) -> Result<Tensor> {
        let data = self.as_f32()?.iter().map(|&x| f(x)).collect();
        Tensor::from_vec(data, &self.shape)
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.map(|x| x.max(0.0))
    }

    /// GELU, tanh approximation: 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3)))
    pub fn gelu(&self) -> Result<Tensor> {
        self.map(|x| 0.5 * x * (1.0 + (GELU_COEF * (x + 0.044715 * x * x * x)).tanh()))
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.map(|x| x.tanh())
    }

    /// Two-branch sigmoid, stable for large |x|.
    pub fn sigmoid(&self) -> Result<Tensor> {
        self.map(sigmoid_scalar)
    }

    pub fn scale(&self, factor: f32) -> Result<Tensor> {
        self.map(|x| x * factor)
    }

    /// Elementwise add. The right side may be equal-shaped or rank-1 matching
    /// the last axis (bias broadcast).
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip(rhs, |a, b| a * b)
    }

    fn zip(&self, rhs: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        let a = self.as_f32()?;
        let b = rhs.as_f32()?;
        if self.shape == rhs.shape {
            let data = a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
            return Tensor::from_vec(data, &self.shape);
        }
        // Broadcast a rank-1 rhs across the last axis.
        let last = *self.shape.last().unwrap_or(&0);
        if rhs.rank() == 1 && rhs.shape[0] == last && last > 0 {
            let data = a
                .iter()
                .enumerate()
                .map(|(i, &x)| f(x, b[i % last]))
                .collect();
            return Tensor::from_vec(data, &self.shape);
        }
        Err(EngineError::shape(format!(
            "broadcast mismatch: {:?} vs {:?}",
            self.shape, rhs.shape
        )))
    }

    // ============================================================
    // Linear algebra
    // ============================================================

    /// Matrix multiply against a 2-D right operand.
    ///
    /// Accepts rank 1 ([K] @ [K,N] -> [N]), rank 2, or higher ranks, which
    /// are flattened to [rows, K], multiplied, and reshaped back — the same
    /// contract every projection in the model family relies on.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        if rhs.rank() != 2 {
            return Err(EngineError::shape(format!(
                "matmul right operand must be rank 2, got {:?}",
                rhs.shape
            )));
        }
        let (k_r, n) = (rhs.shape[0], rhs.shape[1]);
        let k = *self
            .shape
            .last()
            .ok_or_else(|| EngineError::shape("matmul on rank-0 tensor".to_string()))?;
        if k != k_r {
            return Err(EngineError::shape(format!(
                "matmul inner dim mismatch: {:?} @ {:?}",
                self.shape, rhs.shape
            )));
        }

        let rows = self.len() / k;
        let a = self.as_f32()?;
        let b = rhs.as_f32()?;

        let mut out = vec![0.0f32; rows * n];
        // Parallelize over output rows; each row is an independent dot sweep.
        out.par_chunks_mut(n).enumerate().for_each(|(i, out_row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for (l, &av) in a_row.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let b_row = &b[l * n..(l + 1) * n];
                for (o, &bv) in out_row.iter_mut().zip(b_row.iter()) {
                    *o += av * bv;
                }
            }
        });

        let mut shape = self.shape[..self.rank() - 1].to_vec();
        shape.push(n);
        if self.rank() == 1 {
            shape = vec![n];
        }
        Tensor::from_vec(out, &shape)
    }

    /// Numerically stable softmax along the last axis.
    pub fn softmax(&self) -> Result<Tensor> {
        let last = *self
            .shape
            .last()
            .ok_or_else(|| EngineError::shape("softmax on rank-0 tensor".to_string()))?;
        if last == 0 {
            return Err(EngineError::shape("softmax over empty axis".to_string()));
        }
        let data = self.as_f32()?;
        let mut out = vec![0.0f32; data.len()];
        for (row, out_row) in data.chunks(last).zip(out.chunks_mut(last)) {
            softmax_row(row, out_row)?;
        }
        Tensor::from_vec(out, &self.shape)
    }

    /// Layer norm over the last axis with affine gamma/beta.
    pub fn layer_norm(&self, gamma: &Tensor, beta: &Tensor) -> Result<Tensor> {
        let last = *self
            .shape
            .last()
            .ok_or_else(|| EngineError::shape("layer_norm on rank-0 tensor".to_string()))?;
        if gamma.len() != last || beta.len() != last {
            return Err(EngineError::shape(format!(
                "layer_norm affine length {} / {} does not match axis {}",
                gamma.len(),
                beta.len(),
                last
            )));
        }
        let data = self.as_f32()?;
        let g = gamma.as_f32()?;
        let b = beta.as_f32()?;
        let mut out = vec![0.0f32; data.len()];
        for (row, out_row) in data.chunks(last).zip(out.chunks_mut(last)) {
            let mean = row.iter().sum::<f32>() / last as f32;
            let var = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / last as f32;
            let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
            for i in 0..last {
                out_row[i] = g[i] * ((row[i] - mean) * inv) + b[i];
            }
        }
        Tensor::from_vec(out, &self.shape)
    }

    /// L2-normalize each row along the last axis.
    pub fn l2_normalize(&self) -> Result<Tensor> {
        let last = *self
            .shape
            .last()
            .ok_or_else(|| EngineError::shape("l2_normalize on rank-0 tensor".to_string()))?;
        let data = self.as_f32()?;
        let mut out = vec![0.0f32; data.len()];
        for (row, out_row) in data.chunks(last).zip(out.chunks_mut(last)) {
            let norm = row.iter().map(|&x| x * x).sum::<f32>().sqrt();
            let inv = 1.0 / (norm + L2_NORM_EPS);
            for (o, &x) in out_row.iter_mut().zip(row.iter()) {
                *o = x * inv;
            }
        }
        Tensor::from_vec(out, &self.shape)
    }

    /// Mean over axis 1 of a [B, T, H] tensor -> [B, H].
    pub fn mean_axis1(&self) -> Result<Tensor> {
        let (b, t, h) = self.dims3()?;
        let data = self.as_f32()?;
        let mut out = vec![0.0f32; b * h];
        for bi in 0..b {
            for ti in 0..t {
                let base = (bi * t + ti) * h;
                for hi in 0..h {
                    out[bi * h + hi] += data[base + hi];
                }
            }
        }
        let inv = 1.0 / t.max(1) as f32;
        for v in out.iter_mut() {
            *v *= inv;
        }
        Tensor::from_vec(out, &[b, h])
    }

    /// Max over axis 1 of a [B, T, H] tensor -> [B, H].
    pub fn max_axis1(&self) -> Result<Tensor> {
        let (b, t, h) = self.dims3()?;
        if t == 0 {
            return Err(EngineError::shape("max over empty axis".to_string()));
        }
        let data = self.as_f32()?;
        let mut out = vec![f32::NEG_INFINITY; b * h];
        for bi in 0..b {
            for ti in 0..t {
                let base = (bi * t + ti) * h;
                for hi in 0..h {
                    let v = data[base + hi];
                    if v > out[bi * h + hi] {
                        out[bi * h + hi] = v;
                    }
                }
            }
        }
        Tensor::from_vec(out, &[b, h])
    }

    /// Columns [start, start+len) of the last axis.
    pub fn slice_last(&self, start: usize, len: usize) -> Result<Tensor> {
        let last = *self
            .shape
            .last()
            .ok_or_else(|| EngineError::shape("slice on rank-0 tensor".to_string()))?;
        if start + len > last {
            return Err(EngineError::shape(format!(
                "slice {}..{} out of range for axis {}",
                start,
                start + len,
                last
            )));
        }
        let data = self.as_f32()?;
        let mut out = Vec::with_capacity(self.len() / last * len);
        for row in data.chunks(last) {
            out.extend_from_slice(&row[start..start + len]);
        }
        let mut shape = self.shape.clone();
        *shape.last_mut().unwrap() = len;
        Tensor::from_vec(out, &shape)
    }

    pub fn transpose2d(&self) -> Result<Tensor> {
        let (m, n) = self.dims2()?;
        let data = self.as_f32()?;
        let mut out = vec![0.0f32; data.len()];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = data[i * n + j];
            }
        }
        Tensor::from_vec(out, &[n, m])
    }

    pub fn dims2(&self) -> Result<(usize, usize)> {
        if self.rank() != 2 {
            return Err(EngineError::shape(format!(
                "expected rank 2, got {:?}",
                self.shape
            )));
        }
        Ok((self.shape[0], self.shape[1]))
    }

    pub fn dims3(&self) -> Result<(usize, usize, usize)> {
        if self.rank() != 3 {
            return Err(EngineError::shape(format!(
                "expected rank 3, got {:?}",
                self.shape
            )));
        }
        Ok((self.shape[0], self.shape[1], self.shape[2]))
    }
}

// ============================================================
// Free helpers
// ============================================================

pub fn sigmoid_scalar(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softmax of one row into `out`, subtracting the row max first.
pub fn softmax_row(row: &[f32], out: &mut [f32]) -> Result<()> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (o, &x) in out.iter_mut().zip(row.iter()) {
        let e = (x - max).exp();
        *o = e;
        sum += e;
    }
    if sum <= 0.0 || !sum.is_finite() {
        return Err(EngineError::numeric(
            "softmax normalizer underflowed".to_string(),
        ));
    }
    let inv = 1.0 / sum;
    for o in out.iter_mut() {
        *o *= inv;
    }
    Ok(())
}

/// Gather rows of an embedding table [V, H] for a list of ids -> [len, H].
pub fn lookup_rows(table: &Tensor, ids: &[u32]) -> Result<Tensor> {
    let (v, h) = table.dims2()?;
    let data = table.as_f32()?;
    let mut out = Vec::with_capacity(ids.len() * h);
    for &id in ids {
        let id = id as usize;
        if id >= v {
            return Err(EngineError::shape(format!(
                "id {} out of vocabulary range {}",
                id, v
            )));
        }
        out.extend_from_slice(&data[id * h..(id + 1) * h]);
    }
    Tensor::from_vec(out, &[ids.len(), h])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_2d() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.as_f32().unwrap(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn matmul_3d_flattens() {
        let a = Tensor::ones(&[2, 3, 4]);
        let b = Tensor::ones(&[4, 5]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 5]);
        assert!(c.as_f32().unwrap().iter().all(|&v| (v - 4.0).abs() < 1e-6));
    }

    #[test]
    fn matmul_rank1() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2]);
        assert_eq!(c.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn matmul_mismatch_is_shape_error() {
        let a = Tensor::ones(&[2, 3]);
        let b = Tensor::ones(&[4, 5]);
        assert!(matches!(a.matmul(&b), Err(EngineError::Shape(_))));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], &[2, 3]).unwrap();
        let s = t.softmax().unwrap();
        for row in s.as_f32().unwrap().chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn layer_norm_moments() {
        let mut rng = rand::thread_rng();
        let t = Tensor::randn(&[4, 64], 2.0, &mut rng);
        let normed = t
            .layer_norm(&Tensor::ones(&[64]), &Tensor::zeros(&[64]))
            .unwrap();
        for row in normed.as_f32().unwrap().chunks(64) {
            let mean: f32 = row.iter().sum::<f32>() / 64.0;
            let var: f32 = row.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / 64.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn l2_normalize_unit_rows() {
        let t = Tensor::from_vec(vec![3.0, 4.0, 0.0, 5.0], &[2, 2]).unwrap();
        let n = t.l2_normalize().unwrap();
        for row in n.as_f32().unwrap().chunks(2) {
            let norm: f32 = row.iter().map(|&x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn gelu_reference_values() {
        let t = Tensor::from_vec(vec![0.0, 1.0, -1.0], &[3]).unwrap();
        let g = t.gelu().unwrap();
        let out = g.as_f32().unwrap();
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.841192).abs() < 1e-4);
        assert!((out[2] + 0.158808).abs() < 1e-4);
    }

    #[test]
    fn bias_broadcast() {
        let t = Tensor::zeros(&[2, 3]);
        let bias = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let out = t.add(&bias).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn stack_and_index() {
        let rows = vec![
            Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap(),
            Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap(),
        ];
        let stacked = Tensor::stack(&rows).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        let back = stacked.index_axis0(1).unwrap();
        assert_eq!(back.as_f32().unwrap(), &[3.0, 4.0]);
    }
}

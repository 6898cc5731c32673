//! Parameter store: the uniform container every model keeps its weights,
//! buffers, metadata, and lifecycle state in.
//!
//! Names are opaque dot/underscore paths chosen by the model constructors;
//! the store preserves insertion order so that save, load, summary, and
//! export all walk entries identically.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::tensor::{Dtype, Tensor};

// ============================================================
// Lifecycle and metadata
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Uninitialized,
    Initialized,
    Training,
    Trained,
    Exported,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Uninitialized => "uninitialized",
            ModelState::Initialized => "initialized",
            ModelState::Training => "training",
            ModelState::Trained => "trained",
            ModelState::Exported => "exported",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub parameters: usize,
    pub device: String,
    pub quantization: String,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ============================================================
// Ordered tensor map
// ============================================================

/// String-keyed tensor map with deterministic insertion order.
#[derive(Clone, Debug, Default)]
pub struct TensorMap {
    order: Vec<String>,
    items: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        if !self.items.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.items.insert(name, tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.items.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.items.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.order.retain(|n| n != name);
        self.items.remove(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.order.iter().map(move |n| (n, &self.items[n]))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
    }
}

// ============================================================
// Parameter store
// ============================================================

#[derive(Clone, Debug)]
pub struct ParamStore {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub device: String,
    /// Quantization tag: fp32 | fp16 | int8 | int4.
    pub quantization: String,
    pub state: ModelState,
    pub extra: BTreeMap<String, serde_json::Value>,
    params: TensorMap,
    buffers: TensorMap,
}

impl ParamStore {
    pub fn new(name: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            architecture: architecture.into(),
            device: "cpu".to_string(),
            quantization: "fp32".to_string(),
            state: ModelState::Uninitialized,
            extra: BTreeMap::new(),
            params: TensorMap::default(),
            buffers: TensorMap::default(),
        }
    }

    // --- Parameters ---

    pub fn set_param(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.params.insert(name, tensor);
    }

    pub fn get_param(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn get_param_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params.get_mut(name)
    }

    /// Required-parameter lookup; absence is a fatal configuration error.
    pub fn param(&self, name: &str) -> Result<&Tensor> {
        self.params
            .get(name)
            .ok_or_else(|| EngineError::MissingParameter(name.to_string()))
    }

    pub fn params(&self) -> &TensorMap {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut TensorMap {
        &mut self.params
    }

    // --- Buffers ---

    pub fn set_buffer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.buffers.insert(name, tensor);
    }

    pub fn get_buffer(&self, name: &str) -> Option<&Tensor> {
        self.buffers.get(name)
    }

    pub fn buffers(&self) -> &TensorMap {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut TensorMap {
        &mut self.buffers
    }

    /// Total trainable scalar count: sum of products of parameter shapes.
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|(_, t)| t.len()).sum()
    }

    /// Diagnostic listing; no stability contract.
    pub fn summary(&self, input_shape: &[usize], output_shape: &[usize]) -> String {
        let mut lines = vec![
            format!("Model: {}", self.name),
            format!("Architecture: {}", self.architecture),
            format!("Device: {}", self.device),
            format!("Quantization: {}", self.quantization),
            format!("State: {}", self.state.as_str()),
            format!("Input Shape: {:?}", input_shape),
            format!("Output Shape: {:?}", output_shape),
            format!("Parameters: {}", self.num_parameters()),
            String::new(),
            "Layers:".to_string(),
        ];
        for (name, t) in self.params.iter() {
            lines.push(format!(
                "  {}: {:?} ({})",
                name,
                t.shape(),
                t.dtype().as_str()
            ));
        }
        lines.join("\n")
    }

    // ============================================================
    // Artifact serialization
    // ============================================================

    /// Write the binary weights blob: a 4-byte little-endian header length,
    /// a JSON header describing every entry, then the raw payloads in header
    /// order. Buffers (quant scales and zero points) follow the parameters.
    pub fn write_weights<W: Write>(&self, w: &mut W) -> Result<()> {
        let header = BlobHeader::describe(self);
        let header_json = serde_json::to_vec(&header)?;
        w.write_u32::<LittleEndian>(header_json.len() as u32)?;
        w.write_all(&header_json)?;

        for (_, tensor) in self.params.iter().chain(self.buffers.iter()) {
            write_payload(w, tensor)?;
        }
        Ok(())
    }

    /// Save the paired `{base}.bin` weights blob and `{base}.json` metadata
    /// sidecar.
    pub fn save(&self, base: &Path, metadata: &ModelMetadata) -> Result<()> {
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(base.with_extension("bin"))?;
        self.write_weights(&mut file)?;

        let meta_json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(base.with_extension("json"), meta_json)?;
        Ok(())
    }

    /// Load weights and metadata written by [`ParamStore::save`]. Replaces
    /// the current entries; the state becomes `Trained`.
    pub fn load(&mut self, base: &Path) -> Result<ModelMetadata> {
        let file = File::open(base.with_extension("bin"))?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };

        if mmap.len() < 4 {
            return Err(EngineError::shape(
                "weights file too short for header length".to_string(),
            ));
        }
        let header_len =
            u32::from_le_bytes([mmap[0], mmap[1], mmap[2], mmap[3]]) as usize;
        let header_end = 4 + header_len;
        if mmap.len() < header_end {
            return Err(EngineError::shape(
                "weights file too short for header".to_string(),
            ));
        }
        let header: BlobHeader = serde_json::from_slice(&mmap[4..header_end])?;

        self.params.clear();
        self.buffers.clear();

        let mut offset = header_end;
        for name in &header.parameter_names {
            let tensor = read_payload(&header, name, &mmap, &mut offset)?;
            self.params.insert(name.clone(), tensor);
        }
        for name in &header.buffer_names {
            let tensor = read_payload(&header, name, &mmap, &mut offset)?;
            self.buffers.insert(name.clone(), tensor);
        }

        let meta_path = base.with_extension("json");
        let metadata: ModelMetadata = if meta_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(meta_path)?)?
        } else {
            ModelMetadata {
                name: self.name.clone(),
                version: self.version.clone(),
                architecture: self.architecture.clone(),
                input_shape: vec![],
                output_shape: vec![],
                parameters: self.num_parameters(),
                device: self.device.clone(),
                quantization: self.quantization.clone(),
                extra: BTreeMap::new(),
            }
        };

        self.name = metadata.name.clone();
        self.version = metadata.version.clone();
        self.device = metadata.device.clone();
        self.quantization = metadata.quantization.clone();
        self.state = ModelState::Trained;
        Ok(metadata)
    }
}

// ============================================================
// Blob header
// ============================================================

#[derive(Serialize, Deserialize)]
struct BlobHeader {
    num_parameters: usize,
    parameter_names: Vec<String>,
    #[serde(default)]
    buffer_names: Vec<String>,
    shapes: BTreeMap<String, Vec<usize>>,
    dtypes: BTreeMap<String, String>,
}

impl BlobHeader {
    fn describe(store: &ParamStore) -> Self {
        let mut shapes = BTreeMap::new();
        let mut dtypes = BTreeMap::new();
        for (name, t) in store.params.iter().chain(store.buffers.iter()) {
            shapes.insert(name.clone(), t.shape().to_vec());
            dtypes.insert(name.clone(), t.dtype().as_str().to_string());
        }
        Self {
            num_parameters: store.params.len(),
            parameter_names: store.params.names().to_vec(),
            buffer_names: store.buffers.names().to_vec(),
            shapes,
            dtypes,
        }
    }
}

fn write_payload<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    match tensor.dtype() {
        Dtype::F32 => {
            for &v in tensor.as_f32()? {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        Dtype::F16 => {
            for &v in tensor.as_f16()? {
                w.write_u16::<LittleEndian>(v.to_bits())?;
            }
        }
        Dtype::I8 => {
            for &v in tensor.as_i8()? {
                w.write_i8(v)?;
            }
        }
    }
    Ok(())
}

fn read_payload(
    header: &BlobHeader,
    name: &str,
    bytes: &[u8],
    offset: &mut usize,
) -> Result<Tensor> {
    let shape = header
        .shapes
        .get(name)
        .ok_or_else(|| EngineError::shape(format!("header has no shape for `{name}`")))?;
    let dtype_str = header
        .dtypes
        .get(name)
        .ok_or_else(|| EngineError::shape(format!("header has no dtype for `{name}`")))?;
    let dtype = Dtype::parse(dtype_str)?;

    let count: usize = shape.iter().product();
    let byte_len = count * dtype.size_of();
    let end = *offset + byte_len;
    if bytes.len() < end {
        return Err(EngineError::shape(format!(
            "weights payload truncated at `{name}`: need {} bytes, have {}",
            byte_len,
            bytes.len().saturating_sub(*offset)
        )));
    }
    let raw = &bytes[*offset..end];
    *offset = end;

    match dtype {
        Dtype::F32 => {
            let data = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_vec(data, shape)
        }
        Dtype::F16 => {
            let data = raw
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                .collect();
            Tensor::from_f16(data, shape)
        }
        Dtype::I8 => {
            let data = raw.iter().map(|&b| b as i8).collect();
            Tensor::from_i8(data, shape)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> ParamStore {
        let mut store = ParamStore::new("unit", "TestNet");
        store.set_param(
            "layer_0_weight",
            Tensor::from_vec(vec![1.5, -2.25, 0.0, 4.0], &[2, 2]).unwrap(),
        );
        store.set_param(
            "layer_0_bias",
            Tensor::from_vec(vec![0.5, -0.5], &[2]).unwrap(),
        );
        store.set_buffer(
            "layer_0_weight_scale",
            Tensor::from_vec(vec![0.031], &[1]).unwrap(),
        );
        store.state = ModelState::Initialized;
        store
    }

    fn sample_metadata(store: &ParamStore) -> ModelMetadata {
        ModelMetadata {
            name: store.name.clone(),
            version: store.version.clone(),
            architecture: store.architecture.clone(),
            input_shape: vec![2],
            output_shape: vec![2],
            parameters: store.num_parameters(),
            device: store.device.clone(),
            quantization: store.quantization.clone(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn insertion_order_is_preserved() {
        let store = sample_store();
        let names: Vec<_> = store.params().names().to_vec();
        assert_eq!(names, vec!["layer_0_weight", "layer_0_bias"]);
    }

    #[test]
    fn num_parameters_sums_shapes() {
        let store = sample_store();
        assert_eq!(store.num_parameters(), 6);
    }

    #[test]
    fn missing_parameter_is_fatal() {
        let store = sample_store();
        assert!(matches!(
            store.param("layer_9_weight"),
            Err(EngineError::MissingParameter(_))
        ));
    }

    #[test]
    fn save_load_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model");

        let store = sample_store();
        store.save(&base, &sample_metadata(&store)).unwrap();

        let mut loaded = ParamStore::new("unit", "TestNet");
        let meta = loaded.load(&base).unwrap();

        assert_eq!(loaded.state, ModelState::Trained);
        assert_eq!(meta.parameters, 6);
        assert_eq!(
            loaded.param("layer_0_weight").unwrap().as_f32().unwrap(),
            store.param("layer_0_weight").unwrap().as_f32().unwrap()
        );
        assert_eq!(
            loaded
                .get_buffer("layer_0_weight_scale")
                .unwrap()
                .as_f32()
                .unwrap(),
            &[0.031]
        );
    }

    #[test]
    fn truncated_blob_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model");
        let store = sample_store();
        store.save(&base, &sample_metadata(&store)).unwrap();

        let bin = base.with_extension("bin");
        let bytes = std::fs::read(&bin).unwrap();
        std::fs::write(&bin, &bytes[..bytes.len() - 4]).unwrap();

        let mut loaded = ParamStore::new("unit", "TestNet");
        assert!(matches!(loaded.load(&base), Err(EngineError::Shape(_))));
    }
}

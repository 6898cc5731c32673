//! Save/load and quantization round trips across the artifact format.

use wren_engine::models::{Classifier, ClassifierConfig, Model};
use wren_engine::params::ModelState;
use wren_engine::tensor::Tensor;
use wren_engine::Dtype;

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

fn fixed_batch() -> Tensor {
    let data: Vec<f32> = (0..32).map(|i| ((i * 37 % 17) as f32 - 8.0) / 8.0).collect();
    Tensor::from_vec(data, &[4, 8]).unwrap()
}

#[test]
fn fp32_save_load_preserves_parameters_bit_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clf");

    let model = classifier();
    model.save(&base).unwrap();

    let mut loaded = classifier();
    loaded.load(&base).unwrap();

    assert_eq!(loaded.store().state, ModelState::Trained);
    for (name, tensor) in model.store().params().iter() {
        let restored = loaded.store().param(name).unwrap();
        assert_eq!(tensor.shape(), restored.shape());
        assert_eq!(tensor.as_f32().unwrap(), restored.as_f32().unwrap());
    }

    // Forward on the loaded model reproduces the original exactly.
    let batch = fixed_batch();
    let a = model.forward(&batch).unwrap();
    let b = loaded.forward(&batch).unwrap();
    assert_eq!(a.as_f32().unwrap(), b.as_f32().unwrap());
}

#[test]
fn fp16_quantized_round_trip_matches_cast_reference() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clf16");
    let batch = fixed_batch();

    let model = classifier();
    let fp32_out = model.forward(&batch).unwrap();

    // Reference: cast down to f16 and back up, in memory.
    let mut reference = classifier();
    for (name, tensor) in model.store().params().iter() {
        reference.store_mut().set_param(name.clone(), tensor.clone());
    }
    reference.quantize("fp16").unwrap();
    reference.dequantize().unwrap();
    let reference_out = reference.forward(&batch).unwrap();

    // Same cast, but through save and load.
    let mut quantized = classifier();
    for (name, tensor) in model.store().params().iter() {
        quantized.store_mut().set_param(name.clone(), tensor.clone());
    }
    quantized.quantize("fp16").unwrap();
    quantized.save(&base).unwrap();

    let mut reloaded = classifier();
    reloaded.load(&base).unwrap();
    assert_eq!(reloaded.store().quantization, "fp16");
    for (_, tensor) in reloaded.store().params().iter() {
        assert_eq!(tensor.dtype(), Dtype::F16);
    }
    reloaded.dequantize().unwrap();
    let reloaded_out = reloaded.forward(&batch).unwrap();

    // The persisted cast is bit-identical to the in-memory cast, and both
    // stay close to the fp32 output.
    assert_eq!(
        reference_out.as_f32().unwrap(),
        reloaded_out.as_f32().unwrap()
    );
    for (a, b) in fp32_out
        .as_f32()
        .unwrap()
        .iter()
        .zip(reloaded_out.as_f32().unwrap().iter())
    {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn int8_quantized_round_trip_preserves_values_and_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("clf8");

    let mut model = classifier();
    model.quantize("int8").unwrap();
    let saved_weights: Vec<Vec<i8>> = model
        .store()
        .params()
        .iter()
        .map(|(_, t)| t.as_i8().unwrap().to_vec())
        .collect();
    model.save(&base).unwrap();

    let mut reloaded = classifier();
    reloaded.load(&base).unwrap();

    assert_eq!(reloaded.store().quantization, "int8");
    let restored: Vec<Vec<i8>> = reloaded
        .store()
        .params()
        .iter()
        .map(|(_, t)| t.as_i8().unwrap().to_vec())
        .collect();
    assert_eq!(saved_weights, restored);

    // Every parameter carries its scale buffer through the round trip.
    for name in reloaded.store().params().names() {
        let scale = reloaded
            .store()
            .get_buffer(&format!("{name}_scale"))
            .expect("scale buffer missing");
        assert!(scale.as_f32().unwrap()[0] > 0.0);
    }
}

#[test]
fn metadata_reports_parameter_identity() {
    let model = classifier();
    let meta = model.metadata();
    // num_parameters equals the sum of shape products: 8*4 + 4 + 4*2 + 2.
    assert_eq!(meta.parameters, 46);
    assert_eq!(meta.parameters, model.num_parameters());
    assert_eq!(meta.input_shape, vec![8]);
    assert_eq!(meta.output_shape, vec![2]);
    assert_eq!(meta.quantization, "fp32");
}

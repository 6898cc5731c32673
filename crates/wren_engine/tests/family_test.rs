//! Cross-family invariants: parameter accounting, output simplices, shapes,
//! and normalization, for every architecture at once.

use wren_engine::models::{
    Classifier, ClassifierConfig, Model, ModelKind, NeuralCompressor, NeuralCompressorConfig,
    SemanticEncoder, SemanticEncoderConfig, TextGenerator, TextGeneratorConfig, TransformerConfig,
    TransformerLite,
};
use wren_engine::tensor::Tensor;

fn family() -> Vec<Box<dyn Model>> {
    vec![
        Box::new(
            TransformerLite::new(TransformerConfig {
                hidden_size: 32,
                num_layers: 1,
                num_heads: 2,
                intermediate_size: 64,
                max_seq_length: 16,
                vocab_size: 100,
                dropout: 0.1,
            })
            .unwrap(),
        ),
        Box::new(
            NeuralCompressor::new(NeuralCompressorConfig {
                context_size: 32,
                hidden_size: 16,
                num_layers: 1,
            })
            .unwrap(),
        ),
        Box::new(
            SemanticEncoder::new(SemanticEncoderConfig {
                embedding_dim: 24,
                hidden_size: 16,
                num_layers: 1,
                vocab_size: 100,
                max_seq_length: 16,
                normalize_output: true,
            })
            .unwrap(),
        ),
        Box::new(
            Classifier::new(ClassifierConfig {
                input_dim: 8,
                hidden_dims: vec![4],
                num_classes: 3,
                multi_label: false,
                dropout: 0.1,
            })
            .unwrap(),
        ),
        Box::new(
            TextGenerator::new(TextGeneratorConfig {
                vocab_size: 100,
                hidden_size: 16,
                num_layers: 1,
                max_length: 16,
            })
            .unwrap(),
        ),
    ]
}

#[test]
fn num_parameters_equals_sum_of_shape_products_for_every_model() {
    for model in family() {
        let total: usize = model.store().params().iter().map(|(_, t)| t.len()).sum();
        assert_eq!(
            model.num_parameters(),
            total,
            "mismatch for {:?}",
            model.kind()
        );
        assert_eq!(model.metadata().parameters, total);
    }
}

#[test]
fn every_kind_is_distinct_and_summary_lists_parameters() {
    let kinds: Vec<ModelKind> = family().iter().map(|m| m.kind()).collect();
    assert_eq!(kinds.len(), 5);
    for (i, a) in kinds.iter().enumerate() {
        for b in kinds.iter().skip(i + 1) {
            assert_ne!(a, b);
        }
    }

    for model in family() {
        let summary = model.summary();
        for name in model.store().params().names() {
            assert!(summary.contains(name.as_str()), "summary missing {name}");
        }
    }
}

#[test]
fn transformer_forward_and_encode_shapes() {
    let model = TransformerLite::new(TransformerConfig {
        hidden_size: 64,
        num_layers: 2,
        num_heads: 2,
        intermediate_size: 128,
        max_seq_length: 32,
        vocab_size: 1000,
        dropout: 0.1,
    })
    .unwrap();

    let ids: Vec<Vec<u32>> = (0..2)
        .map(|b| (0..16).map(|t| ((b * 117 + t * 13) % 1000) as u32).collect())
        .collect();

    let hidden = model.forward_ids(&ids, None).unwrap();
    assert_eq!(hidden.shape(), &[2, 16, 64]);

    let pooled = model.encode(&ids, "mean").unwrap();
    assert_eq!(pooled.shape(), &[2, 64]);
}

#[test]
fn compressor_prediction_is_a_simplex_for_any_context() {
    let model = NeuralCompressor::new(NeuralCompressorConfig {
        context_size: 32,
        hidden_size: 32,
        num_layers: 1,
    })
    .unwrap();

    for len in [1usize, 7, 32] {
        let context: Vec<u8> = (0..len).map(|i| (i * 41 % 256) as u8).collect();
        let (probs, _) = model.predict_next_byte(&[context], None, 1.0).unwrap();
        assert_eq!(probs.shape(), &[1, 256]);
        let row = probs.as_f32().unwrap();
        assert!(row.iter().all(|&p| p >= 0.0));
        let sum: f32 = row.iter().sum();
        assert!((0.99..=1.01).contains(&sum), "sum {sum} for len {len}");
    }
}

#[test]
fn encoder_identity_and_unit_norm() {
    let model = SemanticEncoder::new(SemanticEncoderConfig {
        embedding_dim: 64,
        hidden_size: 32,
        num_layers: 2,
        vocab_size: 1000,
        max_seq_length: 32,
        normalize_output: true,
    })
    .unwrap();

    let ids = vec![vec![3u32, 14, 15, 92, 65]];
    let a = model.encode(&ids).unwrap();
    let b = model.encode(&ids).unwrap();
    assert_eq!(a.as_f32().unwrap(), b.as_f32().unwrap());

    let sim = model.similarity(&a, &b).unwrap();
    assert!((sim.as_f32().unwrap()[0] - 1.0).abs() <= 1e-3);

    for row in a.as_f32().unwrap().chunks(64) {
        let norm: f32 = row.iter().map(|&x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-2);
    }
}

#[test]
fn classifier_batch_rows_sum_to_one() {
    let model = Classifier::new(ClassifierConfig {
        input_dim: 8,
        hidden_dims: vec![4],
        num_classes: 2,
        multi_label: false,
        dropout: 0.0,
    })
    .unwrap();

    let mut rng = rand::thread_rng();
    let x = Tensor::randn(&[4, 8], 1.0, &mut rng);
    let probs = model.predict(&x).unwrap();
    assert_eq!(probs.shape(), &[4, 2]);
    for row in probs.as_f32().unwrap().chunks(2) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() <= 1e-3);
    }
}

#[test]
fn uniform_forward_surface_accepts_id_tensors() {
    // The trait-level forward takes ids through the f32 tensor surface.
    let model = TextGenerator::new(TextGeneratorConfig {
        vocab_size: 60,
        hidden_size: 16,
        num_layers: 1,
        max_length: 16,
    })
    .unwrap();

    let ids = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3]).unwrap();
    let logits = model.forward(&ids).unwrap();
    assert_eq!(logits.shape(), &[1, 3, 60]);
}

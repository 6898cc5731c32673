//! Dynamic batching end to end: bounded wait, id routing, and a real model
//! behind the process function.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wren_engine::batch::{BatchProcessor, BatchProcessorConfig};
use wren_engine::models::{Classifier, ClassifierConfig, Model};
use wren_engine::tensor::Tensor;

#[test]
fn ten_submissions_double_and_route_within_the_wait_bound() {
    let processor = BatchProcessor::new(
        |t: &Tensor| t.scale(2.0),
        BatchProcessorConfig {
            max_batch_size: 4,
            max_wait_ms: 10,
            num_workers: 2,
        },
    );
    processor.start();

    let started = Instant::now();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for i in 0..10 {
            let processor = &processor;
            handles.push(scope.spawn(move || {
                let id = format!("r{i}");
                let response = processor
                    .submit(
                        Tensor::from_vec(vec![i as f32], &[1]).unwrap(),
                        &id,
                        Some(Duration::from_secs(5)),
                    )
                    .expect("every submission gets a response");
                assert_eq!(response.request_id, id);
                assert_eq!(response.outputs.as_f32().unwrap(), &[2.0 * i as f32]);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    });

    // 10 requests, batches of up to 4, 10ms wait: generous envelope for a
    // trivial process function.
    assert!(started.elapsed() < Duration::from_secs(2));
    processor.stop();
}

#[test]
fn model_behind_the_queue_matches_direct_forward() {
    let model = Arc::new(
        Classifier::new(ClassifierConfig {
            input_dim: 4,
            hidden_dims: vec![3],
            num_classes: 2,
            multi_label: false,
            dropout: 0.0,
        })
        .unwrap(),
    );

    let model_for_queue = Arc::clone(&model);
    let processor = BatchProcessor::new(
        move |batch: &Tensor| model_for_queue.forward(batch),
        BatchProcessorConfig {
            max_batch_size: 8,
            max_wait_ms: 5,
            num_workers: 1,
        },
    );
    processor.start();

    let input = Tensor::from_vec(vec![0.5, -0.5, 1.0, 0.0], &[4]).unwrap();
    let response = processor
        .submit(input.clone(), "single", Some(Duration::from_secs(5)))
        .expect("response expected");

    let direct = model
        .forward(&input.reshape(&[1, 4]).unwrap())
        .unwrap()
        .index_axis0(0)
        .unwrap();
    for (a, b) in response
        .outputs
        .as_f32()
        .unwrap()
        .iter()
        .zip(direct.as_f32().unwrap().iter())
    {
        assert!((a - b).abs() < 1e-6);
    }

    processor.stop();
}

#[test]
fn late_submitter_gets_none_but_scheduler_survives() {
    // Process function slower than the submit deadline.
    let processor = BatchProcessor::new(
        |t: &Tensor| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(t.clone())
        },
        BatchProcessorConfig {
            max_batch_size: 2,
            max_wait_ms: 1,
            num_workers: 1,
        },
    );
    processor.start();

    let response = processor.submit(
        Tensor::from_vec(vec![1.0], &[1]).unwrap(),
        "impatient",
        Some(Duration::from_millis(20)),
    );
    assert!(response.is_none());

    // The orphan response is dropped; the next request still works.
    let response = processor.submit(
        Tensor::from_vec(vec![2.0], &[1]).unwrap(),
        "patient",
        Some(Duration::from_secs(5)),
    );
    assert!(response.is_some());

    processor.stop();
}

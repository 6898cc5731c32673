use anyhow::{bail, Result};
use clap::Args;
use tracing::info;

use wren_engine::models::{
    Classifier, ClassifierConfig, Model, NeuralCompressor, NeuralCompressorConfig,
    SemanticEncoder, SemanticEncoderConfig, TransformerConfig, TransformerLite,
};
use wren_engine::{Predictor, PredictorConfig, Tensor};

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Architecture to benchmark: transformer | compressor | encoder | classifier
    #[arg(short, long, default_value = "classifier")]
    pub arch: String,

    #[arg(long, default_value = "auto")]
    pub device: String,

    #[arg(long, default_value_t = 100)]
    pub iterations: usize,

    #[arg(long, default_value_t = 5)]
    pub warmup: usize,
}

pub fn run(args: BenchArgs) -> Result<()> {
    let model: Box<dyn Model> = match args.arch.as_str() {
        "transformer" => Box::new(TransformerLite::new(TransformerConfig {
            max_seq_length: 64,
            ..Default::default()
        })?),
        "compressor" => Box::new(NeuralCompressor::new(NeuralCompressorConfig {
            context_size: 64,
            ..Default::default()
        })?),
        "encoder" => Box::new(SemanticEncoder::new(SemanticEncoderConfig {
            max_seq_length: 64,
            ..Default::default()
        })?),
        "classifier" => Box::new(Classifier::new(ClassifierConfig::default())?),
        other => bail!("unknown architecture: {other}"),
    };

    info!("benchmarking {:?} for {} iterations", model.kind(), args.iterations);

    let predictor = Predictor::new(
        model.as_ref(),
        PredictorConfig {
            device: args.device.clone(),
            ..Default::default()
        },
    );
    predictor.warmup(args.warmup)?;
    predictor.reset_stats();

    let mut shape = vec![1];
    shape.extend(model.input_shape());
    let input = Tensor::zeros(&shape);
    for _ in 0..args.iterations {
        predictor.predict(&input)?;
    }

    let stats = predictor.get_stats();
    println!("--- Benchmark ---");
    println!("device:      {}", stats.device);
    println!("iterations:  {}", stats.inference_count);
    println!("total:       {:.2} ms", stats.total_latency_ms);
    println!("average:     {:.3} ms", stats.avg_latency_ms);
    println!(
        "throughput:  {:.1} samples/sec",
        if stats.avg_latency_ms > 0.0 {
            1000.0 / stats.avg_latency_ms
        } else {
            0.0
        }
    );
    println!("memory:      {} bytes (peak {})", stats.memory_allocated, stats.memory_peak);
    Ok(())
}

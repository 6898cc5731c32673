use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use wren_engine::models::{Model, NeuralCompressor, NeuralCompressorConfig};
use wren_engine::CompressionAnalyzer;

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// File to analyze
    #[arg(short, long)]
    pub file: String,

    /// Optional trained byte-predictor artifact (base path without extension)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Chunk size for the recurrent estimator
    #[arg(long, default_value_t = 512)]
    pub chunk_size: usize,

    /// Emit the report as JSON instead of the table
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: AnalyzeArgs) -> Result<()> {
    let data = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file))?;
    info!("analyzing {} ({} bytes)", args.file, data.len());

    let mut model = NeuralCompressor::new(NeuralCompressorConfig::default())?;
    if let Some(base) = &args.model {
        model.load(std::path::Path::new(base))?;
        info!("loaded byte predictor from {}", base);
    }

    let analyzer = CompressionAnalyzer::new(&model).with_chunk_size(args.chunk_size);
    let report = analyzer.analyze(&data)?;
    let strategy = analyzer.recommend_strategy(&data)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "report": report,
                "strategy": strategy,
            }))?
        );
        return Ok(());
    }

    println!("--- Compression Analysis ---");
    println!("original size:       {} bytes", report.original_size);
    println!("entropy:             {:.3} bits/byte", report.entropy_bits_per_byte);
    println!("estimated compressed: {} bytes", report.estimated_compressed_size);
    println!("expected ratio:      {:.2}x", report.compression_ratio);
    println!("recommended:         {}", report.recommended_algorithm);
    println!(
        "plan:                {} pass(es) in order {:?}",
        strategy.passes, strategy.order
    );
    Ok(())
}

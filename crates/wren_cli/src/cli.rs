use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wren", about = "Portable neural inference and compression runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze a file for compression strategy
    Analyze(crate::analyze::AnalyzeArgs),
    /// Index a directory of text files and run a semantic query
    Search(crate::search::SearchArgs),
    /// Sample tokens from the text generator
    Generate(crate::generate::GenerateArgs),
    /// Benchmark predictor latency
    Bench(crate::bench::BenchArgs),
    /// List available compute devices
    Devices,
    /// Export a model bundle (wasm or c)
    Export(crate::export::ExportArgs),
}

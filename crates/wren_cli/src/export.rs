use std::path::Path;

use anyhow::{bail, Result};
use clap::Args;
use tracing::info;

use wren_engine::export::{export_to_c, export_to_wasm, CExportConfig};
use wren_engine::models::{Classifier, ClassifierConfig, Model};

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Bundle kind: wasm | c
    #[arg(short, long)]
    pub kind: String,

    /// Output directory
    #[arg(short, long)]
    pub out: String,

    /// Classifier artifact to export (base path without extension);
    /// a freshly initialized model is exported when omitted
    #[arg(short, long)]
    pub model: Option<String>,

    /// Skip int8 quantization in the C bundle
    #[arg(long)]
    pub no_quantize: bool,
}

pub fn run(args: ExportArgs) -> Result<()> {
    let mut model = Classifier::new(ClassifierConfig::default())?;
    if let Some(base) = &args.model {
        model.load(Path::new(base))?;
        info!("loaded classifier from {}", base);
    }

    let out = Path::new(&args.out);
    match args.kind.as_str() {
        "wasm" => export_to_wasm(&mut model, out)?,
        "c" => export_to_c(
            &mut model,
            out,
            CExportConfig {
                quantize: !args.no_quantize,
                quantize_bits: 8,
            },
        )?,
        other => bail!("unknown export kind: {other} (expected wasm or c)"),
    }

    println!("exported {} bundle to {}", args.kind, args.out);
    Ok(())
}

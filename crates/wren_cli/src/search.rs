use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use wren_engine::index::SemanticIndex;
use wren_engine::models::{SemanticEncoder, SemanticEncoderConfig};

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Directory of .txt/.md files to index
    #[arg(short, long)]
    pub dir: String,

    /// Query text
    #[arg(short, long)]
    pub query: String,

    #[arg(long, default_value_t = 5)]
    pub top_k: usize,

    #[arg(long, default_value_t = 0.0)]
    pub min_score: f32,

    /// Persist the built index to this directory
    #[arg(long)]
    pub save: Option<String>,
}

pub fn run(args: SearchArgs) -> Result<()> {
    let encoder = SemanticEncoder::new(SemanticEncoderConfig::default())?;
    let mut index = SemanticIndex::new(encoder);

    let dir = Path::new(&args.dir);
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {:?}", dir))? {
        let path = entry?.path();
        let is_text = path
            .extension()
            .is_some_and(|ext| ext == "txt" || ext == "md");
        if !is_text {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("skipping {:?}: {}", path, e);
                continue;
            }
        };
        let doc_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        index.add(&doc_id, &content, &doc_id, BTreeMap::new())?;
    }

    info!("indexed {} documents from {:?}", index.len(), dir);
    index.build_index();

    let results = index.search(&args.query, args.top_k, args.min_score)?;
    if results.is_empty() {
        println!("no results");
    }
    for (rank, result) in results.iter().enumerate() {
        println!(
            "{}. {} ({:.3})\n   {}",
            rank + 1,
            result.title,
            result.score,
            result.content_preview.replace('\n', " ")
        );
    }

    if let Some(save_dir) = &args.save {
        index.save(Path::new(save_dir))?;
        println!("index saved to {save_dir}");
    }
    Ok(())
}

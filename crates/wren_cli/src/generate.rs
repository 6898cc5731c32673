use anyhow::Result;
use clap::Args;
use tracing::info;

use wren_engine::models::{GenerateOptions, Model, TextGenerator, TextGeneratorConfig};
use wren_engine::tokenizer;

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Prompt text (folded through the character tokenizer)
    #[arg(short, long)]
    pub prompt: String,

    /// Optional trained generator artifact (base path without extension)
    #[arg(short, long)]
    pub model: Option<String>,

    #[arg(long, default_value_t = 50)]
    pub max_tokens: usize,

    #[arg(long, default_value_t = 1.0)]
    pub temp: f32,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub top_p: Option<f32>,
}

pub fn run(args: GenerateArgs) -> Result<()> {
    let mut model = TextGenerator::new(TextGeneratorConfig::default())?;
    if let Some(base) = &args.model {
        model.load(std::path::Path::new(base))?;
        info!("loaded generator from {}", base);
    } else {
        info!("no artifact given; sampling from random weights");
    }

    let cfg = model.config().clone();
    let prompt_ids = tokenizer::tokenize(&args.prompt, cfg.vocab_size, cfg.max_length);

    let generated = model.generate(
        &prompt_ids,
        &GenerateOptions {
            max_new_tokens: args.max_tokens,
            temperature: args.temp,
            top_k: args.top_k,
            top_p: args.top_p,
            eos_token_id: None,
        },
    )?;

    println!("prompt ids:    {:?}", prompt_ids);
    println!("generated ids: {:?}", &generated[prompt_ids.len()..]);
    println!("decoded:       {}", tokenizer::detokenize(&generated));
    Ok(())
}

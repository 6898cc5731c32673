use anyhow::Result;
use clap::Parser;

mod analyze;
mod bench;
mod cli;
mod devices;
mod export;
mod generate;
mod search;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // 1. File logging
    let file_appender = tracing_appender::rolling::daily("logs", "wren.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // 2. Console logging
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    // 3. Combine subscribers
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze(args) => analyze::run(args)?,
        Commands::Search(args) => search::run(args)?,
        Commands::Generate(args) => generate::run(args)?,
        Commands::Bench(args) => bench::run(args)?,
        Commands::Devices => devices::run()?,
        Commands::Export(args) => export::run(args)?,
    }

    Ok(())
}

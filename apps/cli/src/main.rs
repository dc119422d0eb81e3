//! intelhub CLI: run the intelligence hub and query its archive.
//!
//! Collects documents, scores them through an AI provider under a rotating
//! account pool, and archives the validated results.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}

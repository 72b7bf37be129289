//! ConceptForge CLI: LLM-driven concept extraction for course material.
//!
//! Turns course content into a deduplicated, reviewable concept database.

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

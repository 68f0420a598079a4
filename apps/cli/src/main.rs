//! imgdesc CLI: batch image description.
//!
//! Generates a range of image URLs, downloads them, asks a multimodal model
//! to describe each one, and stores URLs, bytes and descriptions in libSQL.

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

//! folio CLI: fetch catalog items and assemble each into a single bundle.
//!
//! Scans a paginated listing, downloads every item's fragments through a
//! fixed-size worker pool, and writes one Markdown bundle per item.

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

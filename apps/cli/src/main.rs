//! lienflow CLI: enrichment and legal-analysis runs for foreclosure auction
//! properties.
//!
//! Seeds a run from an auction export (or the database, to resume), drives
//! every property through enrichment and title analysis, and offers the
//! administrative recovery workflow for rows stuck after retries.

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

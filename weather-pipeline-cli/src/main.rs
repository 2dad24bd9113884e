//! Binary crate for the `weather-pipeline` batch tool.
//!
//! This crate focuses on:
//! - Parsing CLI arguments
//! - Wiring config into the pipeline stages
//! - Interactive configuration
//! - Human-friendly output formatting

use clap::Parser;

mod cli;
mod logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::Cli::parse();
    let _logging = logging::scoped(cmd.verbose);
    cmd.run().await
}

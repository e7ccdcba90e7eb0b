//! Binary crate for the `weather` command-line tool.
//!
//! This crate focuses on:
//! - Parsing CLI arguments
//! - Logging setup and process lifecycle (Ctrl-C)
//! - Interactive configuration
//! - Human-friendly output formatting

use clap::Parser;

mod broadcast;
mod cli;
mod configure;
mod logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::Cli::parse();
    logging::init(cmd.verbose)?;
    cmd.run().await
}

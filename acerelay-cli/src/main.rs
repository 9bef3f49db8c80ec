//! Acerelay CLI - Command-line interface
//!
//! Runs the relay server, a one-off probe cycle, or an engine ping.

mod commands;

use std::path::PathBuf;

use acerelay_core::tracing_setup::{CliLogLevel, init_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(name = "acerelay")]
#[command(about = "Multiplexing relay and stream prober for a media engine")]
struct Cli {
    /// Console log level, overridden by RUST_LOG
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}

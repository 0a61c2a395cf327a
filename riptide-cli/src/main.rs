//! Riptide CLI - seed a local file or fetch a torrent from known peers

mod commands;

use std::path::PathBuf;

use clap::Parser;
use riptide_swarm::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "riptide")]
#[command(about = "Exchange torrent pieces directly with known peers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;
    tracing::debug!(log_file = %log_file.display(), "Tracing initialised");

    commands::handle_command(cli.command).await
}

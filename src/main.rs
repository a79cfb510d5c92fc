mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{config::ConfigArgs, start::StartArgs};

#[derive(Parser)]
#[command(author, version, about = "ThreatDBX telemetry server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.threatdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ThreatDBX server
    Start(StartArgs),
    /// Stop the ThreatDBX server
    Stop,
    /// Display ThreatDBX server status
    Status,
    /// Update system configuration
    Config(ConfigArgs),
    /// Internal command used for daemonized server execution
    #[command(name = "__internal:server", hide = true)]
    InternalServer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => commands::start::execute(config, args).await?,
        Commands::Stop => commands::start::stop(config)?,
        Commands::Status => commands::start::status(config)?,
        Commands::Config(args) => commands::config::execute(config, args)?,
        Commands::InternalServer => commands::start::run_internal(config).await?,
    }

    Ok(())
}

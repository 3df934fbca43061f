//! TeleDrive command line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "teledrive", version)]
#[command(about = "Store files of any size in a Telegram channel")]
pub(crate) struct Cli {
    /// Configuration file (default: ~/.config/teledrive/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-memory backend. Nothing outlives the process.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Verify the credentials and the destination channel.
    Login,

    /// Upload a file and print its transfer record.
    Upload {
        file: PathBuf,
        /// Label used in part captions (default: the file name).
        #[arg(long)]
        label: Option<String>,
        /// Write the record to this file instead of stdout.
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Rebuild a file from its transfer record.
    Download { record: PathBuf, output: PathBuf },

    /// Delete every part of a transfer record.
    Delete { record: PathBuf },

    /// Show session state and effective settings.
    Status,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        memory = cli.memory,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli, config))
}

//! Ebbtide CLI - Command-line torrent engine
//!
//! Provides command-line access to Ebbtide functionality.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ebbtide_core::tracing_setup::{CliLogLevel, init_tracing};

/// Main CLI structure for the Ebbtide torrent client.
#[derive(Parser)]
#[command(name = "ebbtide")]
#[command(about = "A BitTorrent swarm engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Console log level
    #[arg(long, global = true, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the engine with one or more torrent files
    Run {
        /// Paths to .torrent files to manage
        #[arg(required = true)]
        torrents: Vec<PathBuf>,

        /// Listen port advertised to trackers
        #[arg(short, long)]
        port: Option<u16>,

        /// Session snapshot file to restore and save
        #[arg(short, long)]
        session: Option<PathBuf>,
    },

    /// Inspect a torrent file without adding it
    Show {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    match cli.command {
        Commands::Run {
            torrents,
            port,
            session,
        } => commands::run(torrents, port, session).await?,
        Commands::Show { torrent } => commands::show(torrent).await?,
    }

    Ok(())
}

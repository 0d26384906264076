//! blockpull command-line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blockpull", version)]
#[command(about = "Pull-based, block-verified file transfer over WebSocket")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verification block size in bytes (must match the peer)
    #[arg(long, global = true)]
    block_size: Option<u64>,

    /// Maximum chunk payload in bytes
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve files to the first peer that connects
    Send {
        /// Files to offer
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Connect to a sender and download every offered file
    Receive {
        /// Sender URL, e.g. ws://host:9480
        url: String,

        /// Directory to write files into
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(block_size) = cli.block_size {
        config.transfer.block_size = block_size;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.transfer.chunk_size = chunk_size;
    }
    config.transfer.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        block_size = config.transfer.block_size,
        chunk_size = config.transfer.chunk_size,
        "starting blockpull"
    );

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Send { files, listen } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            rt.block_on(app::send(config, files))?;
        }
        Command::Receive { url, out } => {
            if let Some(out) = out {
                config.output_dir = out;
            }
            rt.block_on(app::receive(config, url))?;
        }
    }

    Ok(())
}

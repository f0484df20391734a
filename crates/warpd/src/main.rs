//! warpd — the WarpGrid client daemon.
//!
//! Runs the native service checks of an allocation and tracks its
//! deployment health:
//! - State store (redb) holding the latest check results
//! - Checks hook with one observer per native check
//! - Allocation health tracker
//!
//! # Usage
//!
//! ```text
//! warpd watch --alloc alloc.json --config warpd.toml
//! ```

mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use warp_core::ClientConfig;

const DEFAULT_LOG_FILTER: &str = "info,warpd=debug,warpgrid=debug";

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid client daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an allocation's checks until its health verdict, then print it.
    Watch {
        /// Allocation to watch (JSON).
        #[arg(long)]
        alloc: PathBuf,

        /// Client configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Watch { alloc, config } => {
            let config = match config {
                Some(path) => ClientConfig::from_file(&path)?,
                None => ClientConfig::default(),
            };
            init_tracing(&config);
            debug!(?config, "configuration loaded");

            if let Some(report) = watch::watch_allocation(&alloc, &config).await? {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(config: &ClientConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = config.log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        tracing_subscriber::EnvFilter::try_new(directive)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

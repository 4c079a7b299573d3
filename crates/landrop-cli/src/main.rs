//! Landrop CLI - device-to-device backup transfer and restore
//!
//! Landrop receives a backup archive from another device on the local
//! network and restores it into this device's data directory.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the device holding the backup
//! landrop send ./backup.zip
//!
//! # On the device being restored, with the scanned payload
//! landrop receive '{"candidates":[{"host":"192.168.1.20","port":7017}]}'
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Receive(args) => commands::receive::run(args).await,
        Command::Restore(args) => commands::restore::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,landrop=info,landrop_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

//! CLI command definitions and handlers.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tokio::sync::watch;

use landrop_core::orchestrator::{Navigator, Notifier};
use landrop_core::restore::{OverallStatus, RestoreSnapshot, StepId, StepStatus};
use landrop_core::transfer::TransferProgress;

pub mod config;
pub mod receive;
pub mod restore;
pub mod send;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> landrop_core::config::Config {
    landrop_core::config::Config::load().unwrap_or_default()
}

/// Landrop - device-to-device backup transfer and restore
#[derive(Parser)]
#[command(name = "landrop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Receive a backup from another device and restore it
    Receive(ReceiveArgs),

    /// Restore a backup file already on this device
    Restore(RestoreArgs),

    /// Serve a backup file to a receiving device
    Send(SendArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the receive command
#[derive(Parser)]
pub struct ReceiveArgs {
    /// Scanned payload: candidate JSON or a legacy `host[:port]` string
    pub payload: String,

    /// Directory for the received archive
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stay on the restore screen after a successful restore
    #[arg(long)]
    pub no_redirect: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the restore command
#[derive(Parser)]
pub struct RestoreArgs {
    /// Backup archive to restore
    pub file: PathBuf,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Backup archive to send
    pub file: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Do not print the QR code
    #[arg(long)]
    pub no_qr: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Value to set
        value: String,
    },
    /// Show all configuration
    Show,
    /// Print the configuration file location
    Path,
    /// Reset to defaults
    Reset,
}

/// Prints notifications to stderr.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify_disconnected(&self) {
        eprintln!();
        eprintln!("  The sending device disconnected before the backup arrived.");
        eprintln!("  Go back and scan the code again to retry.");
    }

    fn notify_error(&self, step: StepId, message: &str) {
        eprintln!();
        eprintln!("  {} failed: {message}", step_label(step));
    }
}

/// Logs where a successful restore would lead.
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_after_success(&self) -> BoxFuture<'_, landrop_core::Result<()>> {
        Box::pin(async {
            tracing::info!("Restore complete, opening a new chat with the default assistant");
            Ok(())
        })
    }

    fn go_back(&self) {
        tracing::info!("Returning to the data settings screen");
    }
}

/// Human-readable step name.
pub fn step_label(step: StepId) -> &'static str {
    match step {
        StepId::ReceiveFile => "Receiving backup",
        StepId::Extract => "Extracting archive",
        StepId::Validate => "Validating backup",
        StepId::Import => "Importing data",
    }
}

/// Print each step change until the run reaches a terminal status.
pub async fn display_steps(mut rx: watch::Receiver<RestoreSnapshot>) {
    let mut shown: Vec<(StepId, StepStatus)> = Vec::new();

    loop {
        let snapshot = rx.borrow_and_update().clone();
        for step in &snapshot.steps {
            let previous = shown.iter_mut().find(|(id, _)| *id == step.id);
            let changed = match previous {
                Some((_, status)) if *status == step.status => false,
                Some((_, status)) => {
                    *status = step.status;
                    true
                }
                None => {
                    shown.push((step.id, step.status));
                    step.status != StepStatus::Pending
                }
            };
            if changed {
                print_step(step.id, step.status, step.message.as_deref());
            }
        }

        if snapshot.overall != OverallStatus::InProgress || rx.changed().await.is_err() {
            break;
        }
    }
}

fn print_step(step: StepId, status: StepStatus, message: Option<&str>) {
    let mark = match status {
        StepStatus::Pending => " ",
        StepStatus::InProgress => "…",
        StepStatus::Completed => "✓",
        StepStatus::Error => "✗",
    };
    match message {
        Some(message) => println!("  [{mark}] {} - {message}", step_label(step)),
        None => println!("  [{mark}] {}", step_label(step)),
    }
}

/// Print a progress line for the in-flight file.
pub async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    loop {
        if rx.changed().await.is_err() {
            break;
        }

        let progress = rx.borrow().clone();
        let Some(filename) = &progress.filename else {
            continue;
        };

        let elapsed = progress
            .started_at
            .map_or(0.0, |started| started.elapsed().as_secs_f64());
        let speed = if elapsed > 0.0 {
            format_size((progress.bytes_received as f64 / elapsed) as u64)
        } else {
            "--".to_string()
        };

        print!(
            "\r  [{:>6.2}%] {} - {}/s    ",
            progress.percentage(),
            filename,
            speed
        );
        let _ = io::stdout().flush();

        if progress.total_bytes > 0 && progress.bytes_received >= progress.total_bytes {
            println!();
        }
    }
}

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_parse_receive_args() {
        let cli = Cli::parse_from(["landrop", "receive", "192.168.1.20:7017", "--no-redirect"]);
        match cli.command {
            Command::Receive(args) => {
                assert_eq!(args.payload, "192.168.1.20:7017");
                assert!(args.no_redirect);
                assert!(args.output.is_none());
            }
            _ => panic!("expected receive"),
        }
    }

    #[test]
    fn test_parse_config_set() {
        let cli = Cli::parse_from(["landrop", "config", "set", "probe_timeout", "5s"]);
        assert!(matches!(
            cli.command,
            Command::Config(ConfigArgs {
                action: ConfigAction::Set { .. }
            })
        ));
    }
}

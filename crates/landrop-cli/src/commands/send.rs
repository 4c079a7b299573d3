//! Send command implementation.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;

use landrop_core::qr;
use landrop_core::sender::{LandropSender, SenderConfig};

use super::SendArgs;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config();
    let port = args.port.unwrap_or(config.network.default_port);

    let sender = LandropSender::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SenderConfig::from_config(&config),
    )
    .await?;
    let info = sender.connection_info()?;
    let payload = qr::payload_for(&info)?;

    if args.json {
        let output = serde_json::json!({
            "status": "waiting",
            "payload": &payload,
            "candidates": info.candidates(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        println!();
        println!("Landrop v{}", landrop_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        if !args.no_qr {
            match qr::generate_ascii(&payload) {
                Ok(code) => {
                    for line in code.lines() {
                        println!("  {line}");
                    }
                }
                Err(e) => tracing::warn!("Could not render QR code: {e}"),
            }
            println!();
        }
        println!("  Scan the code on the receiving device, or run:");
        println!("    landrop receive '{payload}'");
        println!();
        println!("  Waiting for receiver...");
    }

    let report = tokio::select! {
        report = sender.serve_file(&args.file) => report?,
        _ = tokio::signal::ctrl_c() => {
            if !args.json {
                println!();
                println!("  Cancelled.");
            }
            return Ok(());
        }
    };

    if args.json {
        let output = serde_json::json!({
            "status": "sent",
            "receiver": &report.receiver,
            "address": report.peer.to_string(),
            "filename": &report.filename,
            "bytes": report.bytes,
            "chunks": report.chunks,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        println!();
        println!(
            "  Sent {} ({}) to {} ({})",
            report.filename,
            super::format_size(report.bytes),
            report.receiver,
            report.peer
        );
        println!();
    }

    Ok(())
}

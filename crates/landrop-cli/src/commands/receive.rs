//! Receive command implementation.

use std::sync::Arc;

use anyhow::Result;

use landrop_core::connection::{CandidateResolver, ConnectionInfo};
use landrop_core::orchestrator::{RestoreOrchestrator, RestoreReport};
use landrop_core::restore::{landrop_restore_steps, FsBackupStore, RestoreStepRunner};
use landrop_core::transfer::{
    ClientConfig, FailureReason, TransferSocketClient, TransferStatus,
};

use super::{ConsoleNotifier, LogNavigator, ReceiveArgs};

/// Run the receive command.
pub async fn run(args: ReceiveArgs) -> Result<()> {
    let config = super::load_config();
    let info = ConnectionInfo::from_payload(&args.payload, config.network.default_port)?;

    let mut client_config = ClientConfig::from_config(&config);
    if let Some(output) = args.output.clone() {
        client_config.storage_dir = output;
    }
    let storage_dir = client_config.storage_dir.clone();

    if !args.quiet && !args.json {
        println!();
        println!("Landrop v{}", landrop_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Looking for the sending device...");
        for candidate in info.candidates() {
            println!("    {candidate}");
        }
        println!();
    }

    let store = FsBackupStore::new(config.data_dir());
    let restored_dir = store.restored_dir();
    let runner = RestoreStepRunner::from_config(&config.restore)
        .configure(landrop_restore_steps(Arc::new(store)));

    let mut client = TransferSocketClient::new(
        client_config,
        CandidateResolver::from_config(&config.network),
    );
    let subscription = client.subscribe();

    let orchestrator = RestoreOrchestrator::new(
        runner.clone(),
        Arc::new(ConsoleNotifier),
        Arc::new(LogNavigator),
        config.restore.redirect_on_success && !args.no_redirect,
    );

    let progress_task = (!args.quiet && !args.json)
        .then(|| tokio::spawn(super::display_progress(client.progress())));
    let steps_task = (!args.quiet && !args.json)
        .then(|| tokio::spawn(super::display_steps(runner.subscribe())));

    let report = tokio::select! {
        ((), report) = async {
            tokio::join!(client.connect(info), orchestrator.run(subscription))
        } => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };

    client.close().await;
    if let Some(task) = progress_task {
        task.abort();
    }
    if let Some(task) = steps_task {
        let _ = tokio::time::timeout(std::time::Duration::from_millis(200), task).await;
    }

    let Some(report) = report else {
        if !args.json {
            println!();
            println!("  Cancelled.");
        }
        return Ok(());
    };

    if args.json {
        print_json(&report, &storage_dir, &restored_dir)?;
    } else if !args.quiet {
        print_summary(&report, &restored_dir);
    }

    if report.overall == Some(landrop_core::restore::OverallStatus::Success) {
        Ok(())
    } else {
        anyhow::bail!("restore did not complete")
    }
}

fn print_summary(report: &RestoreReport, restored_dir: &std::path::Path) {
    println!();
    match &report.last_status {
        TransferStatus::FileComplete { filename, size, .. } => {
            println!(
                "  Received {} ({})",
                filename,
                super::format_size(*size)
            );
        }
        TransferStatus::Error { reason } => {
            println!("  Transfer failed: {reason}");
            if let Some(hint) = reason.suggestion() {
                println!("  {hint}");
            }
        }
        other => println!("  Transfer ended: {}", other.label()),
    }
    if report.overall == Some(landrop_core::restore::OverallStatus::Success) {
        println!("  Backup restored to {}", restored_dir.display());
    }
    println!();
}

fn print_json(
    report: &RestoreReport,
    storage_dir: &std::path::Path,
    restored_dir: &std::path::Path,
) -> Result<()> {
    let error = match &report.last_status {
        TransferStatus::Error { reason } => Some(failure_json(reason)),
        _ => None,
    };
    let output = serde_json::json!({
        "status": report.last_status.label(),
        "filename": report.last_status.filename(),
        "error": error,
        "storage_dir": storage_dir.display().to_string(),
        "restored_dir": restored_dir.display().to_string(),
        "restore": &report.snapshot,
        "redirected": report.redirected,
        "finished_at": chrono::Local::now().to_rfc3339(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn failure_json(reason: &FailureReason) -> serde_json::Value {
    serde_json::json!({
        "message": reason.to_string(),
        "code": landrop_core::Error::from(reason.clone()).code(),
        "recoverable": reason.is_recoverable(),
        "suggestion": reason.suggestion(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_host_json_offers_rescan() {
        let value = failure_json(&FailureReason::NoReachableHost { attempted: 3 });
        assert_eq!(value["message"], "no reachable host among 3 candidate(s)");
        assert_eq!(value["code"], "E001");
        assert_eq!(value["recoverable"], true);
        assert!(value["suggestion"]
            .as_str()
            .unwrap()
            .contains("scan the QR code again"));
    }
}

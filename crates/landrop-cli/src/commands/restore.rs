//! Restore command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};

use landrop_core::orchestrator::Notifier;
use landrop_core::restore::{
    local_restore_steps, FsBackupStore, OverallStatus, RestoreInput, RestoreStepRunner,
    StartOptions, StepStatus,
};

use super::{ConsoleNotifier, RestoreArgs};

/// Run the restore command.
pub async fn run(args: RestoreArgs) -> Result<()> {
    let config = super::load_config();
    let input = RestoreInput::from_path(&args.file)
        .with_context(|| format!("cannot restore {}", args.file.display()))?;

    if !args.quiet && !args.json {
        println!();
        println!("Landrop v{}", landrop_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Restoring {} ({})",
            input.name,
            super::format_size(input.size)
        );
        println!();
    }

    let store = FsBackupStore::new(config.data_dir());
    let restored_dir = store.restored_dir();
    let runner = RestoreStepRunner::from_config(&config.restore)
        .configure(local_restore_steps(Arc::new(store)));

    let steps_task = (!args.quiet && !args.json)
        .then(|| tokio::spawn(super::display_steps(runner.subscribe())));

    let overall = runner.start(input, StartOptions::default()).await?;
    if let Some(task) = steps_task {
        let _ = task.await;
    }

    let snapshot = runner.snapshot();
    if let Some(failed) = snapshot.steps.iter().find(|s| s.status == StepStatus::Error) {
        ConsoleNotifier.notify_error(failed.id, failed.message.as_deref().unwrap_or("failed"));
    }

    if args.json {
        let output = serde_json::json!({
            "status": overall,
            "restore": snapshot,
            "restored_dir": restored_dir.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet && overall == OverallStatus::Success {
        println!();
        println!("  Backup restored to {}", restored_dir.display());
        println!();
    }

    runner.close_modal();
    if overall == OverallStatus::Success {
        Ok(())
    } else {
        anyhow::bail!("restore failed")
    }
}

//! Drives a restore from transfer status changes.
//!
//! The orchestrator consumes [`TransferStatus`] values in the order the
//! client published them and turns them into runner calls:
//!
//! - `ReceivingFile` resets the steps, opens the modal if it is closed and
//!   marks `RECEIVE_FILE` in progress
//! - `FileComplete` completes `RECEIVE_FILE` and runs the remaining steps
//! - `Error`, or `Disconnected` with a file in flight, fails `RECEIVE_FILE`
//!
//! User-facing notifications are sent at most once until the session makes
//! progress again, and the success redirect happens at most once per run.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::restore::{
    OverallStatus, RestoreInput, RestoreSnapshot, RunnerHandle, StartOptions, StepId, StepStatus,
};
use crate::transfer::{StatusSubscription, TransferStatus};

/// User-facing notifications.
pub trait Notifier: Send + Sync {
    /// The sender went away after a successful connection.
    fn notify_disconnected(&self);

    /// A step failed.
    fn notify_error(&self, step: StepId, message: &str);
}

/// Post-restore navigation.
pub trait Navigator: Send + Sync {
    /// Leave the restore screen after a successful restore.
    fn redirect_after_success(&self) -> BoxFuture<'_, Result<()>>;

    /// Return to the previous screen when the redirect fails.
    fn go_back(&self);
}

/// How an orchestrated session ended.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Last transfer status observed
    pub last_status: TransferStatus,
    /// Outcome of the restore run, if one started
    pub overall: Option<OverallStatus>,
    /// Final runner state
    pub snapshot: RestoreSnapshot,
    /// Whether the success redirect ran
    pub redirected: bool,
}

/// Bridges the transfer session to a restore runner.
pub struct RestoreOrchestrator {
    runner: RunnerHandle,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
    redirect_on_success: bool,

    notified: bool,
    connected: bool,
    file_in_flight: Option<String>,
    redirected: bool,
    overall: Option<OverallStatus>,
}

impl std::fmt::Debug for RestoreOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreOrchestrator")
            .field("redirect_on_success", &self.redirect_on_success)
            .field("file_in_flight", &self.file_in_flight)
            .field("redirected", &self.redirected)
            .finish_non_exhaustive()
    }
}

impl RestoreOrchestrator {
    /// Create an orchestrator for `runner`.
    pub fn new(
        runner: RunnerHandle,
        notifier: Arc<dyn Notifier>,
        navigator: Arc<dyn Navigator>,
        redirect_on_success: bool,
    ) -> Self {
        Self {
            runner,
            notifier,
            navigator,
            redirect_on_success,
            notified: false,
            connected: false,
            file_in_flight: None,
            redirected: false,
            overall: None,
        }
    }

    /// The runner being driven.
    #[must_use]
    pub fn runner(&self) -> &RunnerHandle {
        &self.runner
    }

    /// Whether the success redirect has run.
    #[must_use]
    pub fn redirected(&self) -> bool {
        self.redirected
    }

    /// React to one status transition.
    pub async fn handle_status(&mut self, status: TransferStatus) {
        tracing::debug!("Orchestrator saw {}", status.label());

        match status {
            TransferStatus::Connecting => {
                self.notified = false;
                self.connected = false;
                self.file_in_flight = None;
            }
            TransferStatus::Connected => {
                self.notified = false;
                self.connected = true;
            }
            TransferStatus::ReceivingFile { filename, .. } => {
                self.notified = false;
                if let Err(e) = self.runner.reset() {
                    tracing::warn!("Could not reset restore steps: {e}");
                }
                if !self.runner.is_modal_open() {
                    self.runner.open_modal();
                }
                self.redirected = false;
                self.overall = None;
                let _ = self
                    .runner
                    .update_step_status(StepId::ReceiveFile, StepStatus::InProgress);
                self.file_in_flight = Some(filename);
            }
            TransferStatus::FileComplete {
                filename,
                path,
                size,
            } => {
                self.notified = false;
                self.file_in_flight = None;
                let _ = self
                    .runner
                    .update_step_status(StepId::ReceiveFile, StepStatus::Completed);

                let mime_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
                let input = RestoreInput {
                    name: filename,
                    path,
                    size,
                    mime_type,
                };
                let options = StartOptions {
                    skip_modal_setup: true,
                };
                match self.runner.start(input, options).await {
                    Ok(overall) => self.finish_run(overall).await,
                    Err(e) => tracing::warn!("Restore not started: {e}"),
                }
            }
            TransferStatus::Error { reason } => {
                let message = reason.to_string();
                if self.file_in_flight.take().is_some() {
                    let _ = self.runner.set_step_error(StepId::ReceiveFile, &message);
                }
                if !self.notified {
                    self.notified = true;
                    let notice = match reason.suggestion() {
                        Some(hint) => format!("{message}. {hint}"),
                        None => message,
                    };
                    self.notifier.notify_error(StepId::ReceiveFile, &notice);
                }
            }
            TransferStatus::Disconnected => {
                if let Some(filename) = self.file_in_flight.take() {
                    let message = format!("connection closed while receiving '{filename}'");
                    let _ = self.runner.set_step_error(StepId::ReceiveFile, message);
                }
                if self.connected && !self.notified {
                    self.notified = true;
                    self.notifier.notify_disconnected();
                }
                self.connected = false;
            }
        }
    }

    async fn finish_run(&mut self, overall: OverallStatus) {
        self.overall = Some(overall);
        match overall {
            OverallStatus::Success => {
                if self.redirect_on_success && !self.redirected {
                    self.redirected = true;
                    if let Err(e) = self.navigator.redirect_after_success().await {
                        tracing::warn!("Post-restore redirect failed, going back: {e}");
                        self.navigator.go_back();
                    }
                    self.runner.close_modal();
                }
            }
            OverallStatus::Error => {
                let snapshot = self.runner.snapshot();
                if let Some(step) = snapshot
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Error)
                {
                    let message = step.message.as_deref().unwrap_or("step failed");
                    self.notifier.notify_error(step.id, message);
                }
            }
            OverallStatus::InProgress => {
                tracing::debug!("Restore run ended without a terminal status");
            }
        }
    }

    /// Consume statuses until the session ends or the restore finishes.
    pub async fn run(mut self, mut subscription: StatusSubscription) -> RestoreReport {
        let mut last_status = TransferStatus::Disconnected;

        while let Some(status) = subscription.recv().await {
            last_status = status.clone();
            let done = matches!(
                status,
                TransferStatus::Error { .. }
                    | TransferStatus::Disconnected
                    | TransferStatus::FileComplete { .. }
            );
            self.handle_status(status).await;
            if done {
                break;
            }
        }

        RestoreReport {
            last_status,
            overall: self.overall,
            snapshot: self.runner.snapshot(),
            redirected: self.redirected,
        }
    }
}

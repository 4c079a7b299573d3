//! Ordered multi-step restore runner.
//!
//! A run type is declared once as an ordered list of [`StepConfig`]s. Steps
//! either run an async [`RestoreAction`] owned by the runner or are driven
//! from outside through [`RunnerHandle::update_step_status`] (the socket layer
//! drives `RECEIVE_FILE` this way).
//!
//! Steps run strictly in order. A failed step halts the run and keeps its
//! message; later steps stay `Pending` until the next [`RunnerHandle::start`].
//! Every change republishes a [`RestoreSnapshot`] on a `watch` channel.

pub mod steps;
pub mod store;

pub use steps::{landrop_restore_steps, local_restore_steps, BackupManifest};
pub use store::{ArchiveHandle, BackupStore, FsBackupStore, ImportSummary};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::RestoreConfig;
use crate::error::{Error, Result};

/// Default upper bound for a single step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Identifier of a restore step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepId {
    /// Receive the archive from the sender
    ReceiveFile,
    /// Unpack the archive
    Extract,
    /// Check the backup manifest
    Validate,
    /// Import the backup into local storage
    Import,
}

impl StepId {
    /// Stable identifier used in logs and JSON output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReceiveFile => "RECEIVE_FILE",
            Self::Extract => "EXTRACT",
            Self::Validate => "VALIDATE",
            Self::Import => "IMPORT",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    #[default]
    Pending,
    /// Running
    InProgress,
    /// Finished successfully
    Completed,
    /// Failed
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        })
    }
}

/// Status of a whole run, derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// At least one step has not finished
    InProgress,
    /// Every step completed
    Success,
    /// A step failed
    Error,
}

impl OverallStatus {
    /// `Error` if any step failed, `Success` if all completed, else `InProgress`.
    #[must_use]
    pub fn derive(steps: &[RestoreStep]) -> Self {
        if steps.iter().any(|s| s.status == StepStatus::Error) {
            Self::Error
        } else if steps.iter().all(|s| s.status == StepStatus::Completed) {
            Self::Success
        } else {
            Self::InProgress
        }
    }
}

/// Observable state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreStep {
    /// Step identifier
    pub id: StepId,
    /// Display title
    pub title: String,
    /// Current status
    pub status: StepStatus,
    /// Failure text, only set while `status` is `Error`
    pub message: Option<String>,
}

/// Read-only view of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSnapshot {
    /// Whether the progress surface is visible
    pub modal_open: bool,
    /// Steps in declared order
    pub steps: Vec<RestoreStep>,
    /// Derived overall status
    pub overall: OverallStatus,
}

impl RestoreSnapshot {
    /// Look up a step by id.
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&RestoreStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Archive to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreInput {
    /// File name
    pub name: String,
    /// Location on disk
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
}

impl RestoreInput {
    /// Describe an archive already on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be inspected.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::InvalidBackup(format!(
                "{} is not a file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map_or_else(|| "backup.zip".to_string(), |n| n.to_string_lossy().into_owned());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Ok(Self {
            name,
            path: path.to_path_buf(),
            size: metadata.len(),
            mime_type,
        })
    }
}

/// Mutable state threaded through the steps of one run.
#[derive(Debug)]
pub struct RestoreContext {
    /// The archive being restored
    pub input: RestoreInput,
    /// Scratch directory owned by this run
    pub work_dir: PathBuf,
    /// Set by the extract step
    pub extracted_dir: Option<PathBuf>,
}

impl RestoreContext {
    /// Create a context with a fresh scratch directory path.
    #[must_use]
    pub fn new(input: RestoreInput) -> Self {
        let work_dir =
            std::env::temp_dir().join(format!("landrop-restore-{}", uuid::Uuid::new_v4()));
        Self {
            input,
            work_dir,
            extracted_dir: None,
        }
    }

    async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => tracing::debug!("Removed work directory {}", self.work_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove work directory {}: {e}",
                self.work_dir.display()
            ),
        }
    }
}

/// The work a runner-driven step performs.
pub trait RestoreAction: Send + Sync {
    /// Run the step against the shared context.
    fn run<'a>(&'a self, ctx: &'a mut RestoreContext) -> BoxFuture<'a, Result<()>>;
}

/// Who advances a step.
#[derive(Clone)]
pub enum StepDriver {
    /// Pushed from outside via [`RunnerHandle::update_step_status`]
    External,
    /// Executed by the runner
    Action(Arc<dyn RestoreAction>),
}

impl fmt::Debug for StepDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => f.write_str("External"),
            Self::Action(_) => f.write_str("Action(..)"),
        }
    }
}

/// Declaration of one step.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Step identifier
    pub id: StepId,
    /// Display title
    pub title: String,
    /// How the step advances
    pub driver: StepDriver,
}

impl StepConfig {
    /// A step advanced by an external driver.
    pub fn external(id: StepId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            driver: StepDriver::External,
        }
    }

    /// A step executed by the runner.
    pub fn action(id: StepId, title: impl Into<String>, action: impl RestoreAction + 'static) -> Self {
        Self {
            id,
            title: title.into(),
            driver: StepDriver::Action(Arc::new(action)),
        }
    }
}

/// Options for [`RunnerHandle::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Keep steps already completed by an external driver and leave the
    /// modal as it is
    pub skip_modal_setup: bool,
}

/// Builds runners for a run type.
#[derive(Debug, Clone, Copy)]
pub struct RestoreStepRunner {
    step_timeout: Option<Duration>,
}

impl Default for RestoreStepRunner {
    fn default() -> Self {
        Self {
            step_timeout: Some(DEFAULT_STEP_TIMEOUT),
        }
    }
}

impl RestoreStepRunner {
    /// Runner builder with the default step timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner builder using the restore settings.
    #[must_use]
    pub fn from_config(config: &RestoreConfig) -> Self {
        Self {
            step_timeout: config.step_timeout,
        }
    }

    /// Override the per-step timeout; `None` waits forever.
    #[must_use]
    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Declare the step sequence and return a handle to drive it.
    ///
    /// Steps declared twice keep their first position.
    #[must_use]
    pub fn configure(&self, configs: Vec<StepConfig>) -> RunnerHandle {
        let mut unique: Vec<StepConfig> = Vec::with_capacity(configs.len());
        for config in configs {
            if unique.iter().any(|c| c.id == config.id) {
                tracing::warn!("Ignoring duplicate restore step {}", config.id);
                continue;
            }
            unique.push(config);
        }

        let steps: Vec<RestoreStep> = unique
            .iter()
            .map(|c| RestoreStep {
                id: c.id,
                title: c.title.clone(),
                status: StepStatus::Pending,
                message: None,
            })
            .collect();

        let state = RunnerState {
            steps,
            modal_open: false,
            running: false,
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        RunnerHandle {
            inner: Arc::new(RunnerInner {
                configs: unique,
                step_timeout: self.step_timeout,
                state: Mutex::new(state),
                snapshot_tx,
            }),
        }
    }
}

struct RunnerState {
    steps: Vec<RestoreStep>,
    modal_open: bool,
    running: bool,
}

impl RunnerState {
    fn snapshot(&self) -> RestoreSnapshot {
        RestoreSnapshot {
            modal_open: self.modal_open,
            steps: self.steps.clone(),
            overall: OverallStatus::derive(&self.steps),
        }
    }

    fn index_of(&self, id: StepId) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id == id)
            .ok_or(Error::UnknownStep(id))
    }

    fn set(&mut self, index: usize, status: StepStatus, message: Option<String>) {
        let step = &mut self.steps[index];
        step.status = status;
        step.message = if status == StepStatus::Error {
            message
        } else {
            None
        };
    }
}

struct RunnerInner {
    configs: Vec<StepConfig>,
    step_timeout: Option<Duration>,
    state: Mutex<RunnerState>,
    snapshot_tx: watch::Sender<RestoreSnapshot>,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a> {
    inner: &'a RunnerInner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running = false;
    }
}

/// Shared handle to a configured runner.
#[derive(Clone)]
pub struct RunnerHandle {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("snapshot", &self.snapshot())
            .field("step_timeout", &self.inner.step_timeout)
            .finish()
    }
}

impl RunnerHandle {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the state and publish the result.
    fn mutate<T>(&self, f: impl FnOnce(&mut RunnerState) -> T) -> T {
        let mut state = self.lock();
        let out = f(&mut state);
        self.inner.snapshot_tx.send_replace(state.snapshot());
        out
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> RestoreSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receive every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RestoreSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Current overall status.
    #[must_use]
    pub fn overall(&self) -> OverallStatus {
        self.snapshot().overall
    }

    /// Whether a run is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Whether the progress surface is visible.
    #[must_use]
    pub fn is_modal_open(&self) -> bool {
        self.lock().modal_open
    }

    /// Show the progress surface.
    pub fn open_modal(&self) {
        self.mutate(|state| state.modal_open = true);
    }

    /// Hide the progress surface. A running restore keeps going.
    pub fn close_modal(&self) {
        self.mutate(|state| state.modal_open = false);
    }

    /// Put every step back to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunInProgress`] while a run is executing.
    pub fn reset(&self) -> Result<()> {
        self.mutate(|state| {
            if state.running {
                return Err(Error::RunInProgress);
            }
            for i in 0..state.steps.len() {
                state.set(i, StepStatus::Pending, None);
            }
            Ok(())
        })
    }

    /// Push a status for a step from outside the runner.
    ///
    /// Moving a step to `InProgress` or `Completed` requires its predecessor
    /// to be `Completed`. The message is cleared unless the new status is
    /// `Error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStep`] or [`Error::InvalidStepTransition`].
    pub fn update_step_status(&self, id: StepId, status: StepStatus) -> Result<()> {
        self.apply_update(id, status, None)
    }

    /// Mark a step as failed with a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStep`] if the step is not configured.
    pub fn set_step_error(&self, id: StepId, message: impl Into<String>) -> Result<()> {
        self.apply_update(id, StepStatus::Error, Some(message.into()))
    }

    fn apply_update(&self, id: StepId, status: StepStatus, message: Option<String>) -> Result<()> {
        let result = self.mutate(|state| {
            let index = state.index_of(id)?;
            let advancing = matches!(status, StepStatus::InProgress | StepStatus::Completed);
            if advancing && index > 0 {
                let previous = &state.steps[index - 1];
                if previous.status != StepStatus::Completed {
                    return Err(Error::InvalidStepTransition {
                        step: id,
                        status,
                        reason: format!("{} is {}", previous.id, previous.status),
                    });
                }
            }
            state.set(index, status, message);
            Ok(())
        });

        match &result {
            Ok(()) => tracing::debug!("Step {id} -> {status}"),
            Err(e) => tracing::warn!("Rejected step update: {e}"),
        }
        result
    }

    /// Run the configured steps against `input`.
    ///
    /// Returns the overall status once the run halts or finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunInProgress`] if a run is already executing. Step
    /// failures are not errors here; they are recorded on the step.
    pub async fn start(&self, input: RestoreInput, options: StartOptions) -> Result<OverallStatus> {
        let started = self.mutate(|state| {
            if state.running {
                return Err(Error::RunInProgress);
            }
            state.running = true;
            for i in 0..state.steps.len() {
                let keep = options.skip_modal_setup && state.steps[i].status == StepStatus::Completed;
                if !keep {
                    state.set(i, StepStatus::Pending, None);
                }
            }
            if !options.skip_modal_setup {
                state.modal_open = true;
            }
            Ok(())
        });
        if let Err(e) = started {
            tracing::warn!("Ignoring restore start for '{}': {e}", input.name);
            return Err(e);
        }
        let _guard = RunGuard { inner: &self.inner };

        tracing::info!("Starting restore of '{}' ({} bytes)", input.name, input.size);
        let mut ctx = RestoreContext::new(input);

        for (index, config) in self.inner.configs.iter().enumerate() {
            if self.lock().steps[index].status == StepStatus::Completed {
                tracing::debug!("Step {} already completed", config.id);
                continue;
            }

            let outcome = match &config.driver {
                StepDriver::External => Err(Error::StepExecution {
                    step: config.id,
                    message: "not completed by its driver".to_string(),
                }),
                StepDriver::Action(action) => {
                    self.mutate(|state| state.set(index, StepStatus::InProgress, None));
                    tracing::info!("Running step {}: {}", config.id, config.title);
                    self.run_action(config.id, action.as_ref(), &mut ctx).await
                }
            };

            match outcome {
                Ok(()) => {
                    self.mutate(|state| state.set(index, StepStatus::Completed, None));
                    tracing::info!("Step {} completed", config.id);
                }
                Err(e) => {
                    let message = match e {
                        Error::StepExecution { message, .. } => message,
                        other => other.to_string(),
                    };
                    tracing::error!("Step {} failed: {message}", config.id);
                    self.mutate(|state| state.set(index, StepStatus::Error, Some(message)));
                    break;
                }
            }
        }

        ctx.cleanup().await;
        let overall = self.overall();
        tracing::info!("Restore finished: {overall:?}");
        Ok(overall)
    }

    async fn run_action(
        &self,
        step: StepId,
        action: &dyn RestoreAction,
        ctx: &mut RestoreContext,
    ) -> Result<()> {
        match self.inner.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, action.run(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(Error::StepExecution {
                    step,
                    message: format!("timed out after {} seconds", limit.as_secs()),
                }),
            },
            None => action.run(ctx).await,
        }
    }
}

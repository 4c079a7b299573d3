//! Error types for Landrop.
//!
//! This module provides a unified error type for all Landrop operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::restore::StepId;

/// A specialized `Result` type for Landrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transfer session failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The WebSocket could not be opened or the handshake was refused
    #[error("connection refused by {0}")]
    Refused(String),

    /// The sender did not acknowledge the handshake in time
    #[error("handshake timed out after {0} seconds")]
    HandshakeTimeout(u64),

    /// The socket failed or was reset while a file was in flight
    #[error("connection lost while receiving '{0}'")]
    ConnectionLost(String),

    /// The sender aborted the transfer
    #[error("sender aborted the transfer: {0}")]
    Aborted(String),

    /// The received byte count does not match the announced size
    #[error("size mismatch for '{file}': expected {expected} bytes, received {received}")]
    SizeMismatch {
        /// File being received
        file: String,
        /// Size announced in the header
        expected: u64,
        /// Bytes actually written
        received: u64,
    },

    /// The received file could not be written to local storage
    #[error("cannot store received file: {0}")]
    Storage(String),

    /// A socket error outside of a file transfer
    #[error("socket error: {0}")]
    Socket(String),
}

/// The main error type for Landrop.
#[derive(Error, Debug)]
pub enum Error {
    /// No connection candidate answered the probe (E001)
    #[error("no reachable host among {attempted} candidate(s)")]
    NoReachableHost {
        /// Number of candidates tried
        attempted: usize,
    },

    /// Socket-level failure during a session (E002)
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A restore step's action failed (E003)
    #[error("restore step {step} failed: {message}")]
    StepExecution {
        /// Step that failed
        step: StepId,
        /// Human-readable failure
        message: String,
    },

    /// The scanned payload could not be understood (E004)
    #[error("invalid connection payload: {0}")]
    InvalidPayload(String),

    /// A restore run is already active on this runner
    #[error("a restore run is already in progress")]
    RunInProgress,

    /// A step status update would break step ordering
    #[error("cannot move step {step} to {status}: {reason}")]
    InvalidStepTransition {
        /// Step being updated
        step: StepId,
        /// Requested status
        status: crate::restore::StepStatus,
        /// Why the update was rejected
        reason: String,
    },

    /// Unknown step identifier for this runner
    #[error("step {0} is not configured for this run")]
    UnknownStep(StepId),

    /// The backup archive is malformed or unsupported
    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::NoReachableHost { .. } => Some("E001"),
            Self::Transfer(_) => Some("E002"),
            Self::StepExecution { .. } => Some("E003"),
            Self::InvalidPayload(_) => Some("E004"),
            _ => None,
        }
    }

    /// Returns whether a fresh attempt may succeed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoReachableHost { .. } | Self::Transfer(_))
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::NoReachableHost { .. } => Some(
                "Make sure both devices are on the same network, then scan the QR code again.",
            ),
            Self::Transfer(_) => Some("Keep the sender open and start the transfer again."),
            Self::InvalidPayload(_) => {
                Some("Scan the QR code shown by the sender's data transfer screen.")
            }
            Self::InvalidBackup(_) => Some("Create a fresh backup on the sender and retry."),
            _ => None,
        }
    }
}

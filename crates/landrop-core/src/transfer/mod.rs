//! Receiving a backup archive from a sender.
//!
//! This module holds the receiver-side transfer session:
//!
//! - [`TransferSession`] - the protocol state machine
//! - [`StatusHub`] - ordered status fan-out with subscription handles
//! - [`TransferSocketClient`] - the WebSocket client driving the session
//!
//! ## State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting
//! Connecting --handshake ack--> Connected
//! Connecting --timeout/refused--> Error
//! Connected --transfer-header received--> ReceivingFile
//! ReceivingFile --final chunk received--> FileComplete
//! ReceivingFile --socket error/reset--> Error
//! Connected|ReceivingFile|FileComplete --peer closes / heartbeat timeout--> Disconnected
//! any --disconnect()--> Disconnected
//! ```

pub mod client;
pub mod status;

pub use client::{ClientConfig, TransferSocketClient};
pub use status::{StatusHub, StatusSubscription};

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use crate::error::{Error, TransferError};

/// Why a session ended in [`TransferStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No scanned candidate answered
    NoReachableHost {
        /// Number of candidates tried
        attempted: usize,
    },
    /// Socket-level failure
    Transfer(TransferError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReachableHost { attempted } => {
                write!(f, "no reachable host among {attempted} candidate(s)")
            }
            Self::Transfer(e) => write!(f, "{e}"),
        }
    }
}

impl FailureReason {
    /// Whether scanning again and reconnecting may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        Error::from(self.clone()).is_recoverable()
    }

    /// What the user can do about it.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        Error::from(self.clone()).suggestion()
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::NoReachableHost { attempted } => Self::NoReachableHost { attempted },
            FailureReason::Transfer(e) => Self::Transfer(e),
        }
    }
}

/// Status of the transfer session.
///
/// The file name only exists inside the two file-carrying variants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// No session
    #[default]
    Disconnected,
    /// Resolving the host and performing the handshake
    Connecting,
    /// Handshake acknowledged, waiting for a file
    Connected,
    /// A file is being streamed
    ReceivingFile {
        /// Name of the incoming file
        filename: String,
        /// Announced size in bytes
        total_size: u64,
    },
    /// The file has been fully received
    FileComplete {
        /// Name of the received file
        filename: String,
        /// Where the file was written
        path: PathBuf,
        /// Bytes written
        size: u64,
    },
    /// The session failed
    Error {
        /// What went wrong
        reason: FailureReason,
    },
}

impl TransferStatus {
    /// Name of the in-flight or completed file.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::ReceivingFile { filename, .. } | Self::FileComplete { filename, .. } => {
                Some(filename)
            }
            Self::Disconnected | Self::Connecting | Self::Connected | Self::Error { .. } => None,
        }
    }

    /// Whether the session needs a fresh `connect()` to make progress.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error { .. })
    }

    /// Short label for logs and JSON output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ReceivingFile { .. } => "receiving_file",
            Self::FileComplete { .. } => "file_complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Something that happened to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `connect()` was called
    ConnectStarted,
    /// The sender acknowledged the handshake
    HandshakeAck,
    /// Resolution or handshake failed
    ConnectFailed(FailureReason),
    /// A file header arrived
    Header {
        /// Sanitized file name
        filename: String,
        /// Announced size
        total_size: u64,
    },
    /// A binary chunk arrived
    Chunk {
        /// Chunk length in bytes
        len: usize,
    },
    /// The end-of-file marker arrived and the file is on disk
    EndOfFile {
        /// Where the file was written
        path: PathBuf,
        /// Bytes written
        size: u64,
    },
    /// The socket failed
    SocketError(TransferError),
    /// The sender closed the socket
    PeerClosed,
    /// Nothing was heard from the sender within the liveness window
    HeartbeatTimeout,
    /// `disconnect()` was called
    DisconnectRequested,
}

/// Result of applying a [`SessionEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The status changed to this value
    Transition(TransferStatus),
    /// A chunk was accepted for the active file
    Accepted,
    /// The event had no effect in the current status
    Ignored,
}

/// The receiver-side protocol state machine.
///
/// Pure: it performs no I/O and only decides transitions.
#[derive(Debug, Default)]
pub struct TransferSession {
    status: TransferStatus,
}

impl TransferSession {
    /// Create a session in [`TransferStatus::Disconnected`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    /// Apply an event and report what changed.
    pub fn apply(&mut self, event: SessionEvent) -> Outcome {
        use SessionEvent as E;
        use TransferStatus as S;

        let next = match (&self.status, event) {
            (S::Disconnected, E::DisconnectRequested) => return Outcome::Ignored,
            (_, E::DisconnectRequested) => S::Disconnected,

            (S::Disconnected | S::Error { .. }, E::ConnectStarted) => S::Connecting,
            (S::Connecting, E::HandshakeAck) => S::Connected,
            (S::Connecting, E::ConnectFailed(reason)) => S::Error { reason },
            (S::Connecting, E::SocketError(e)) => S::Error {
                reason: FailureReason::Transfer(e),
            },
            (S::Connecting, E::PeerClosed) => S::Error {
                reason: FailureReason::Transfer(TransferError::Refused(
                    "sender closed the connection during the handshake".to_string(),
                )),
            },

            (S::Connected, E::Header { filename, total_size }) => S::ReceivingFile {
                filename,
                total_size,
            },
            (S::ReceivingFile { .. }, E::Chunk { .. }) => return Outcome::Accepted,
            (S::ReceivingFile { filename, .. }, E::EndOfFile { path, size }) => S::FileComplete {
                filename: filename.clone(),
                path,
                size,
            },
            (S::Connected | S::ReceivingFile { .. }, E::SocketError(e)) => S::Error {
                reason: FailureReason::Transfer(e),
            },
            (
                S::Connected | S::ReceivingFile { .. } | S::FileComplete { .. },
                E::PeerClosed | E::HeartbeatTimeout,
            ) => S::Disconnected,
            (S::FileComplete { .. }, E::SocketError(e)) => {
                tracing::debug!("Socket error after file completed: {e}");
                S::Disconnected
            }

            (status, E::Chunk { len }) => {
                tracing::warn!(
                    "Dropping {len}-byte chunk received while {}",
                    status.label()
                );
                return Outcome::Ignored;
            }
            (status, E::Header { filename, .. }) => {
                tracing::warn!(
                    "Dropping header for '{filename}' received while {}",
                    status.label()
                );
                return Outcome::Ignored;
            }
            (status, E::EndOfFile { .. }) => {
                tracing::warn!("Dropping end-of-file marker received while {}", status.label());
                return Outcome::Ignored;
            }
            (
                status,
                event @ (E::ConnectStarted
                | E::HandshakeAck
                | E::ConnectFailed(_)
                | E::SocketError(_)
                | E::PeerClosed
                | E::HeartbeatTimeout),
            ) => {
                tracing::debug!("Ignoring {event:?} while {}", status.label());
                return Outcome::Ignored;
            }
        };

        tracing::debug!("Transfer status {} -> {}", self.status.label(), next.label());
        self.status = next.clone();
        Outcome::Transition(next)
    }
}

/// Progress of the in-flight file.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    /// File being received
    pub filename: Option<String>,
    /// Bytes written so far
    pub bytes_received: u64,
    /// Announced total
    pub total_bytes: u64,
    /// When the header arrived
    pub started_at: Option<Instant>,
}

impl TransferProgress {
    /// Get progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.filename.is_some() {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_received as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Reduce a sender-supplied name to a bare file name safe to create locally.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "landrop-backup.zip".to_string()
    } else {
        cleaned
    }
}

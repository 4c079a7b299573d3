//! Landrop wire protocol.
//!
//! The sender runs a WebSocket server at `ws://<host>:<port>/landrop`. The
//! receiver connects and the two sides exchange:
//!
//! ```text
//! receiver                                   sender
//!    │ ── text  {"type":"hello", ...}  ──────▶ │
//!    │ ◀────── text  {"type":"hello-ack"} ──── │   Connected
//!    │ ◀── text {"type":"zip-file-start", ...} │   ReceivingFile
//!    │ ◀──────────────── binary chunk ──────── │
//!    │ ◀──────────────── binary chunk ──────── │
//!    │ ◀───── text {"type":"zip-file-end"} ─── │   FileComplete
//!    │ ── text {"type":"ping"} ──────────────▶ │   (every heartbeat interval)
//!    │ ◀────────── text {"type":"pong"} ────── │
//! ```
//!
//! Text frames carry JSON control messages tagged by `type`. Binary frames
//! carry raw file bytes and are only meaningful between `zip-file-start` and
//! `zip-file-end`.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

/// Largest binary frame accepted from a sender (16 MB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// JSON control messages exchanged over text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Receiver introduces itself after the WebSocket upgrade
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Receiver device name
        device_name: String,
        /// Protocol version spoken by the receiver
        protocol_version: u32,
    },
    /// Sender accepts the receiver
    #[serde(rename_all = "camelCase")]
    HelloAck {
        /// Sender device name
        device_name: String,
    },
    /// A file is about to be streamed
    #[serde(rename_all = "camelCase")]
    ZipFileStart {
        /// File name as stored on the sender
        filename: String,
        /// Total size in bytes
        total_size: u64,
    },
    /// The last chunk of the current file has been sent
    ZipFileEnd,
    /// Liveness probe
    Ping,
    /// Liveness answer
    Pong,
    /// Sender gave up on the transfer
    Abort {
        /// Human-readable reason
        reason: String,
    },
}

impl ControlMessage {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello-ack",
            Self::ZipFileStart { .. } => "zip-file-start",
            Self::ZipFileEnd => "zip-file-end",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Abort { .. } => "abort",
        }
    }

    /// Encode as a WebSocket text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// A decoded inbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON control message
    Control(ControlMessage),
    /// Raw file bytes
    Chunk(Vec<u8>),
    /// Transport-level ping that must be answered with this payload
    Ping(Vec<u8>),
    /// Peer closed the socket
    Close,
    /// Transport noise with no protocol meaning (pongs, raw frames)
    Noise,
}

impl Frame {
    /// Decode a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] for malformed control messages and
    /// oversized chunks.
    pub fn decode(message: Message) -> Result<Self> {
        match message {
            Message::Text(text) => serde_json::from_str(&text)
                .map(Self::Control)
                .map_err(|e| Error::ProtocolError(format!("bad control message: {e}"))),
            Message::Binary(bytes) => {
                if bytes.len() > MAX_CHUNK_SIZE {
                    return Err(Error::ProtocolError(format!(
                        "chunk of {} bytes exceeds limit of {MAX_CHUNK_SIZE}",
                        bytes.len()
                    )));
                }
                Ok(Self::Chunk(bytes))
            }
            Message::Ping(payload) => Ok(Self::Ping(payload)),
            Message::Close(_) => Ok(Self::Close),
            Message::Pong(_) | Message::Frame(_) => Ok(Self::Noise),
        }
    }
}

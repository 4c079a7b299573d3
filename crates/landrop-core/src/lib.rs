//! # Landrop Core Library
//!
//! `landrop-core` moves a backup archive from one device to another over the
//! local network and restores it.
//!
//! ## Features
//!
//! - **Candidate resolution**: the sender lists every address it may be
//!   reachable on; the receiver picks the first one that answers
//! - **WebSocket transfer**: the archive is streamed as binary chunks with a
//!   heartbeat and guaranteed teardown
//! - **Ordered restore**: receive, extract, validate and import steps with
//!   per-step status and a derived overall status
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - Scanned payloads and host selection
//! - [`error`] - Error types
//! - [`orchestrator`] - Drives a restore from transfer status changes
//! - [`protocol`] - Wire protocol messages
//! - [`qr`] - QR payloads for senders
//! - [`restore`] - Restore step runner, built-in steps and storage
//! - [`sender`] - Sender side of the protocol
//! - [`transfer`] - Receiver session, status stream and socket client
//!
//! ## Example
//!
//! ```rust,ignore
//! use landrop_core::connection::{CandidateResolver, ConnectionInfo};
//! use landrop_core::transfer::{ClientConfig, TransferSocketClient};
//!
//! let config = landrop_core::config::Config::load()?;
//! let info = ConnectionInfo::from_payload(scanned, config.network.default_port)?;
//! let mut client = TransferSocketClient::new(
//!     ClientConfig::from_config(&config),
//!     CandidateResolver::from_config(&config.network),
//! );
//! let statuses = client.subscribe();
//! client.connect(info).await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod qr;
pub mod restore;
pub mod sender;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version sent in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Default sender port (TCP)
pub const DEFAULT_LANDROP_PORT: u16 = 7017;

/// Path of the sender's WebSocket endpoint
pub const LANDROP_WS_PATH: &str = "/landrop";

/// Default chunk size for file transfers (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Newest backup format version this build can restore
pub const SUPPORTED_BACKUP_VERSION: u32 = 5;

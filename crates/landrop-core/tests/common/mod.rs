//! Common test utilities for `Landrop` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use landrop_core::config::ProbeStrategy;
use landrop_core::connection::{CandidateResolver, TcpProber};
use landrop_core::orchestrator::{Navigator, Notifier};
use landrop_core::protocol::{ControlMessage, Frame};
use landrop_core::restore::StepId;
use landrop_core::transfer::{ClientConfig, TransferSocketClient, TransferStatus};

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Write a zip archive with the given entries.
pub fn create_backup_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("Failed to create archive");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for (entry, contents) in entries {
        zip.start_file(*entry, options).expect("Failed to start entry");
        zip.write_all(contents).expect("Failed to write entry");
    }
    zip.finish().expect("Failed to finish archive");
    path
}

/// A minimal valid backup archive.
pub fn create_valid_backup(dir: &Path) -> PathBuf {
    create_backup_zip(
        dir,
        "backup.zip",
        &[
            ("data.json", br#"{"version":5,"time":1700000000000}"#),
            ("Files/notes.md", b"# Notes\n\nrestored from another device\n"),
        ],
    )
}

/// A loopback port with nothing listening on it.
pub async fn unreachable_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// A receiver with short timeouts suitable for loopback tests.
pub fn test_client(storage_dir: &Path) -> TransferSocketClient {
    let config = ClientConfig {
        device_name: "test-receiver".to_string(),
        storage_dir: storage_dir.to_path_buf(),
        connect_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(600),
    };
    let resolver = CandidateResolver::new(
        Arc::new(TcpProber),
        Duration::from_millis(500),
        ProbeStrategy::Sequential,
    );
    TransferSocketClient::new(config, resolver)
}

/// Wait for the next status, failing the test after a few seconds.
pub async fn next_status(sub: &mut landrop_core::transfer::StatusSubscription) -> TransferStatus {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("Timed out waiting for status")
        .expect("Status stream ended")
}

/// One action of a scripted sender after the handshake.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a control message
    Control(ControlMessage),
    /// Send a binary chunk
    Chunk(Vec<u8>),
    /// Drop the connection without a close frame
    Drop,
    /// Send a close frame
    Close,
    /// Stay connected without reading
    Idle,
}

/// Serve one receiver with a fixed script. Connections that never send
/// `hello` (probes) are skipped.
pub async fn spawn_scripted_sender(script: Vec<Action>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut ws = loop {
            let (stream, _) = listener.accept().await.unwrap();
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let mut said_hello = false;
            while let Some(Ok(message)) = ws.next().await {
                if let Ok(Frame::Control(ControlMessage::Hello { .. })) = Frame::decode(message) {
                    said_hello = true;
                    break;
                }
            }
            if said_hello {
                break ws;
            }
        };

        let ack = ControlMessage::HelloAck {
            device_name: "scripted-sender".to_string(),
        };
        ws.send(ack.to_message().unwrap()).await.unwrap();

        for action in script {
            match action {
                Action::Control(message) => ws.send(message.to_message().unwrap()).await.unwrap(),
                Action::Chunk(bytes) => ws.send(Message::Binary(bytes)).await.unwrap(),
                Action::Drop => return,
                Action::Close => {
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                    return;
                }
                Action::Idle => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return;
                }
            }
        }
        let _ = ws.close(None).await;
    });

    (port, handle)
}

/// Notifier that records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Notifications so far, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_disconnected(&self) {
        self.events.lock().unwrap().push("disconnected".to_string());
    }

    fn notify_error(&self, step: StepId, message: &str) {
        self.events.lock().unwrap().push(format!("{step}: {message}"));
    }
}

/// Navigator that counts redirects.
#[derive(Default)]
pub struct CountingNavigator {
    redirects: AtomicUsize,
}

impl CountingNavigator {
    /// Number of redirects performed.
    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl Navigator for CountingNavigator {
    fn redirect_after_success(&self) -> BoxFuture<'_, landrop_core::Result<()>> {
        Box::pin(async move {
            self.redirects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn go_back(&self) {}
}

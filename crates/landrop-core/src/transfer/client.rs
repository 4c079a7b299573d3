//! WebSocket client that receives a backup archive from a sender.
//!
//! The client is an explicitly constructed object owned by whoever drives the
//! restore screen. `connect()` resolves the scanned candidates, performs the
//! handshake and spawns a receive loop; `disconnect()` tears everything down
//! and also runs when the client is dropped, so an open socket never outlives
//! its owner.
//!
//! Failures never escape as errors: they become [`TransferStatus::Error`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::status::{StatusHub, StatusSubscription};
use super::{
    sanitize_filename, FailureReason, Outcome, SessionEvent, TransferProgress, TransferStatus,
};
use crate::config::Config;
use crate::connection::{Candidate, CandidateResolver, ConnectionInfo};
use crate::error::{Error, Result, TransferError};
use crate::protocol::{ControlMessage, Frame};

type WsStream = WebSocketStream<TcpStream>;

/// Settings for a [`TransferSocketClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name sent in the `hello` message
    pub device_name: String,
    /// Directory received files are written to
    pub storage_dir: PathBuf,
    /// Bound on the WebSocket upgrade plus hello/ack exchange
    pub connect_timeout: Duration,
    /// How often to ping the sender
    pub heartbeat_interval: Duration,
    /// Silence after which the sender is considered gone
    pub heartbeat_timeout: Duration,
}

impl ClientConfig {
    /// Derive client settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_name: config.general.device_name.clone(),
            storage_dir: config.storage_dir(),
            connect_timeout: config.network.connect_timeout,
            heartbeat_interval: config.transfer.heartbeat_interval,
            heartbeat_timeout: config.transfer.heartbeat_timeout,
        }
    }
}

/// Configure TCP keep-alive on a socket.
///
/// Probing starts after 10 seconds of idle time and repeats every 5 seconds,
/// so half-open connections are noticed even between heartbeats.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref.set_tcp_keepalive(&keepalive)?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Path of a file that has been created but not completed yet.
type PartialFile = Arc<Mutex<Option<PathBuf>>>;

/// Handle to the background receive loop.
struct SessionTask {
    /// Asks the loop to close the socket gracefully
    stop_tx: oneshot::Sender<()>,
    /// The loop itself
    handle: JoinHandle<()>,
}

/// Receives a backup archive over a Landrop WebSocket session.
pub struct TransferSocketClient {
    config: ClientConfig,
    resolver: CandidateResolver,
    hub: Arc<StatusHub>,
    progress_tx: watch::Sender<TransferProgress>,
    progress_rx: watch::Receiver<TransferProgress>,
    partial: PartialFile,
    task: Option<SessionTask>,
}

impl std::fmt::Debug for TransferSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSocketClient")
            .field("config", &self.config)
            .field("status", &self.hub.current())
            .finish_non_exhaustive()
    }
}

impl Drop for TransferSocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl TransferSocketClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(config: ClientConfig, resolver: CandidateResolver) -> Self {
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());
        Self {
            config,
            resolver,
            hub: StatusHub::new(),
            progress_tx,
            progress_rx,
            partial: Arc::new(Mutex::new(None)),
            task: None,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.hub.current()
    }

    /// Name of the in-flight or completed file.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        self.hub.current().filename().map(ToString::to_string)
    }

    /// Subscribe to every status transition, in order.
    pub fn subscribe(&self) -> StatusSubscription {
        self.hub.subscribe()
    }

    /// Get a progress receiver for the in-flight file.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    /// Connect to the sender described by `info`.
    ///
    /// Any previous session is torn down first. The outcome is observable
    /// through the status stream: `Connected` on success, `Error` otherwise.
    pub async fn connect(&mut self, info: ConnectionInfo) {
        if !self.hub.current().is_terminal() {
            self.disconnect();
        }
        self.stop_task();

        if self.hub.dispatch(SessionEvent::ConnectStarted) == Outcome::Ignored {
            tracing::warn!("connect() ignored: session already active");
            return;
        }
        tracing::info!(
            "Connecting to Landrop sender ({} candidate(s){})",
            info.candidates().len(),
            if info.is_legacy() { ", legacy payload" } else { "" }
        );

        match self.establish(info).await {
            Ok((ws, host)) => {
                if self.hub.dispatch(SessionEvent::HandshakeAck) != Outcome::Ignored {
                    tracing::info!("Connected to Landrop sender at {host}");
                    self.spawn_session(ws);
                }
            }
            Err(reason) => {
                tracing::warn!("Connection failed: {reason}");
                self.hub.dispatch(SessionEvent::ConnectFailed(reason));
            }
        }
    }

    /// Tear down the session.
    ///
    /// Idempotent and safe from cleanup paths: always leaves the status at
    /// `Disconnected` with no file name, and removes a partially received file.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(());
            task.handle.abort();
            tracing::debug!("Receive loop stopped");
        }
        // Dispatch first: a receive loop still mid-poll checks the status
        // before it claims a new partial file.
        let outcome = self.hub.dispatch(SessionEvent::DisconnectRequested);
        remove_partial(&self.partial);
        self.progress_tx.send_replace(TransferProgress::default());

        if let Outcome::Transition(_) = outcome {
            tracing::info!("Disconnected from Landrop sender");
        }
    }

    /// Close the socket gracefully, then disconnect.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(());
            if tokio::time::timeout(Duration::from_secs(2), task.handle)
                .await
                .is_err()
            {
                tracing::debug!("Receive loop did not stop in time");
            }
        }
        self.disconnect();
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }

    async fn establish(
        &self,
        info: ConnectionInfo,
    ) -> std::result::Result<(WsStream, Candidate), FailureReason> {
        let host = match info.selected_host() {
            Some(host) => host.clone(),
            None => self.resolver.resolve(&info).await.map_err(|e| match e {
                Error::NoReachableHost { attempted } => FailureReason::NoReachableHost { attempted },
                other => FailureReason::Transfer(TransferError::Refused(other.to_string())),
            })?,
        };

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.handshake(&host)).await {
            Ok(Ok(ws)) => Ok((ws, host)),
            Ok(Err(e)) => Err(FailureReason::Transfer(e)),
            Err(_) => Err(FailureReason::Transfer(TransferError::HandshakeTimeout(
                timeout.as_secs(),
            ))),
        }
    }

    async fn handshake(&self, host: &Candidate) -> std::result::Result<WsStream, TransferError> {
        let refused = |e: &dyn std::fmt::Display| TransferError::Refused(format!("{host}: {e}"));

        let stream = TcpStream::connect((host.host.as_str(), host.port))
            .await
            .map_err(|e| refused(&e))?;
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::debug!("Could not enable TCP keep-alive: {e}");
        }

        let (mut ws, _) = tokio_tungstenite::client_async(host.websocket_url(), stream)
            .await
            .map_err(|e| refused(&e))?;

        let hello = ControlMessage::Hello {
            device_name: self.config.device_name.clone(),
            protocol_version: crate::PROTOCOL_VERSION,
        };
        let message = hello.to_message().map_err(|e| refused(&e))?;
        ws.send(message).await.map_err(|e| refused(&e))?;

        loop {
            let Some(message) = ws.next().await else {
                return Err(refused(&"connection closed before hello-ack"));
            };
            match Frame::decode(message.map_err(|e| refused(&e))?) {
                Ok(Frame::Control(ControlMessage::HelloAck { device_name })) => {
                    tracing::debug!("Handshake acknowledged by '{device_name}'");
                    return Ok(ws);
                }
                Ok(Frame::Control(ControlMessage::Abort { reason })) => {
                    return Err(refused(&reason));
                }
                Ok(Frame::Ping(payload)) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .map_err(|e| refused(&e))?;
                }
                Ok(Frame::Close) => return Err(refused(&"sender closed the connection")),
                Ok(other) => tracing::debug!("Ignoring {other:?} during handshake"),
                Err(e) => tracing::warn!("Dropping malformed frame during handshake: {e}"),
            }
        }
    }

    fn spawn_session(&mut self, ws: WsStream) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let receiver = SessionLoop {
            ws,
            hub: Arc::clone(&self.hub),
            progress_tx: self.progress_tx.clone(),
            partial: Arc::clone(&self.partial),
            storage_dir: self.config.storage_dir.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            active: None,
        };

        let handle = tokio::spawn(receiver.run(stop_rx));
        self.task = Some(SessionTask { stop_tx, handle });
        tracing::debug!("Receive loop started");
    }
}

/// Record `path` as the file being received, unless the session has moved on
/// from receiving `filename`. In that case the file is removed instead.
fn claim_partial(partial: &PartialFile, hub: &StatusHub, filename: &str, path: &Path) -> bool {
    let mut slot = partial.lock().unwrap_or_else(PoisonError::into_inner);
    let receiving = matches!(
        hub.current(),
        TransferStatus::ReceivingFile { filename: ref current, .. } if current == filename
    );
    if receiving {
        *slot = Some(path.to_path_buf());
        return true;
    }
    drop(slot);

    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Discarded {} after disconnect", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
    }
    false
}

fn remove_partial(partial: &PartialFile) {
    let path = partial
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(path) = path {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove partial file {}: {e}", path.display()),
        }
    }
}

/// File currently being written.
struct ActiveFile {
    filename: String,
    path: PathBuf,
    file: tokio::fs::File,
    total_size: u64,
    written: u64,
}

/// Whether the receive loop keeps running after a frame.
enum Flow {
    Continue,
    Stop,
}

/// State owned by the spawned receive loop.
struct SessionLoop {
    ws: WsStream,
    hub: Arc<StatusHub>,
    progress_tx: watch::Sender<TransferProgress>,
    partial: PartialFile,
    storage_dir: PathBuf,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    active: Option<ActiveFile>,
}

impl SessionLoop {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    tracing::debug!("Receive loop received stop signal");
                    let _ = self.ws.close(None).await;
                    return;
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= self.heartbeat_timeout {
                        tracing::warn!(
                            "No data from sender for {} seconds, closing session",
                            self.heartbeat_timeout.as_secs()
                        );
                        self.discard_active();
                        self.hub.dispatch(SessionEvent::HeartbeatTimeout);
                        return;
                    }
                    if let Err(e) = self.send(&ControlMessage::Ping).await {
                        self.fail(TransferError::Socket(e.to_string()));
                        return;
                    }
                }

                message = self.ws.next() => {
                    last_seen = Instant::now();
                    let flow = match message {
                        Some(Ok(message)) => match Frame::decode(message) {
                            Ok(frame) => self.handle_frame(frame).await,
                            Err(e) => {
                                tracing::warn!("Dropping malformed frame: {e}");
                                Flow::Continue
                            }
                        },
                        Some(Err(e)) => {
                            self.fail(TransferError::Socket(e.to_string()));
                            Flow::Stop
                        }
                        None => {
                            self.fail(TransferError::Socket(
                                "connection reset without close frame".to_string(),
                            ));
                            Flow::Stop
                        }
                    };
                    if let Flow::Stop = flow {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Control(ControlMessage::ZipFileStart {
                filename,
                total_size,
            }) => self.start_file(&filename, total_size).await,
            Frame::Chunk(bytes) => self.write_chunk(&bytes).await,
            Frame::Control(ControlMessage::ZipFileEnd) => self.finish_file().await,
            Frame::Control(ControlMessage::Ping) => match self.send(&ControlMessage::Pong).await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    self.fail(TransferError::Socket(e.to_string()));
                    Flow::Stop
                }
            },
            Frame::Control(ControlMessage::Abort { reason }) => {
                tracing::warn!("Sender aborted: {reason}");
                self.fail(TransferError::Aborted(reason));
                Flow::Stop
            }
            Frame::Control(
                message @ (ControlMessage::Pong
                | ControlMessage::Hello { .. }
                | ControlMessage::HelloAck { .. }),
            ) => {
                tracing::debug!("Received {}", message.kind());
                Flow::Continue
            }
            Frame::Ping(payload) => {
                if let Err(e) = self.ws.send(Message::Pong(payload)).await {
                    self.fail(TransferError::Socket(e.to_string()));
                    return Flow::Stop;
                }
                Flow::Continue
            }
            Frame::Close => {
                tracing::info!("Sender closed the connection");
                self.discard_active();
                self.hub.dispatch(SessionEvent::PeerClosed);
                Flow::Stop
            }
            Frame::Noise => Flow::Continue,
        }
    }

    async fn start_file(&mut self, filename: &str, total_size: u64) -> Flow {
        let filename = sanitize_filename(filename);
        let event = SessionEvent::Header {
            filename: filename.clone(),
            total_size,
        };
        if self.hub.dispatch(event) == Outcome::Ignored {
            return Flow::Continue;
        }

        let path = self.storage_dir.join(&filename);
        match create_file(&self.storage_dir, &path).await {
            Ok(file) => {
                if !claim_partial(&self.partial, &self.hub, &filename, &path) {
                    return Flow::Stop;
                }
                tracing::info!("Receiving '{filename}' ({total_size} bytes)");
                self.progress_tx.send_replace(TransferProgress {
                    filename: Some(filename.clone()),
                    bytes_received: 0,
                    total_bytes: total_size,
                    started_at: Some(Instant::now()),
                });
                self.active = Some(ActiveFile {
                    filename,
                    path,
                    file,
                    total_size,
                    written: 0,
                });
                Flow::Continue
            }
            Err(e) => {
                self.fail(TransferError::Storage(format!("{}: {e}", path.display())));
                Flow::Stop
            }
        }
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> Flow {
        if self.hub.dispatch(SessionEvent::Chunk { len: bytes.len() }) != Outcome::Accepted {
            return Flow::Continue;
        }
        let Some(active) = self.active.as_mut() else {
            tracing::warn!("Dropping chunk: no file open");
            return Flow::Continue;
        };

        if let Err(e) = active.file.write_all(bytes).await {
            let message = format!("{}: {e}", active.path.display());
            self.fail(TransferError::Storage(message));
            return Flow::Stop;
        }
        active.written += bytes.len() as u64;

        let written = active.written;
        self.progress_tx
            .send_modify(|progress| progress.bytes_received = written);
        Flow::Continue
    }

    async fn finish_file(&mut self) -> Flow {
        let Some(mut active) = self.active.take() else {
            tracing::warn!("Dropping end-of-file marker: no file in flight");
            return Flow::Continue;
        };

        let flushed = match active.file.flush().await {
            Ok(()) => active.file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            self.active = Some(active);
            self.fail(TransferError::Storage(e.to_string()));
            return Flow::Stop;
        }

        if active.written != active.total_size {
            let error = TransferError::SizeMismatch {
                file: active.filename.clone(),
                expected: active.total_size,
                received: active.written,
            };
            self.active = Some(active);
            self.fail(error);
            return Flow::Stop;
        }

        self.partial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(
            "Received '{}' ({} bytes) at {}",
            active.filename,
            active.written,
            active.path.display()
        );
        self.hub.dispatch(SessionEvent::EndOfFile {
            path: active.path,
            size: active.written,
        });
        Flow::Continue
    }

    async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        self.ws
            .send(message.to_message()?)
            .await
            .map_err(|e| Error::Transfer(TransferError::Socket(e.to_string())))
    }

    /// Report a socket or storage failure, attributing it to the in-flight
    /// file when there is one.
    fn fail(&mut self, error: TransferError) {
        let error = match (&self.active, error) {
            (Some(active), TransferError::Socket(_)) => {
                TransferError::ConnectionLost(active.filename.clone())
            }
            (_, error) => error,
        };
        tracing::warn!("Transfer failed: {error}");
        self.discard_active();
        self.hub.dispatch(SessionEvent::SocketError(error));
    }

    fn discard_active(&mut self) {
        if self.active.take().is_some() {
            remove_partial(&self.partial);
        }
    }
}

async fn create_file(dir: &Path, path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::File::create(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeStrategy;
    use crate::connection::TcpProber;

    fn client(storage_dir: PathBuf) -> TransferSocketClient {
        let config = ClientConfig {
            device_name: "test-phone".to_string(),
            storage_dir,
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(400),
        };
        let resolver = CandidateResolver::new(
            Arc::new(TcpProber),
            Duration::from_millis(500),
            ProbeStrategy::Sequential,
        );
        TransferSocketClient::new(config, resolver)
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path().to_path_buf());
        let mut sub = client.subscribe();

        client.disconnect();
        client.disconnect();

        assert_eq!(client.status(), TransferStatus::Disconnected);
        assert_eq!(client.filename(), None);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_candidates_end_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path().to_path_buf());
        let mut sub = client.subscribe();

        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let info = ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)]).unwrap();
        client.connect(info).await;

        assert_eq!(sub.try_recv(), Some(TransferStatus::Connecting));
        assert_eq!(
            sub.try_recv(),
            Some(TransferStatus::Error {
                reason: FailureReason::NoReachableHost { attempted: 1 }
            })
        );

        client.disconnect();
        assert_eq!(sub.try_recv(), Some(TransferStatus::Disconnected));
    }

    #[test]
    fn test_partial_file_discarded_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let partial: PartialFile = Arc::new(Mutex::new(None));
        let hub = StatusHub::new();

        std::fs::write(&path, b"").unwrap();
        assert!(!claim_partial(&partial, &hub, "a.zip", &path));
        assert!(!path.exists());
        assert!(partial.lock().unwrap().is_none());

        hub.dispatch(SessionEvent::ConnectStarted);
        hub.dispatch(SessionEvent::HandshakeAck);
        hub.dispatch(SessionEvent::Header {
            filename: "a.zip".to_string(),
            total_size: 3,
        });
        std::fs::write(&path, b"").unwrap();
        assert!(claim_partial(&partial, &hub, "a.zip", &path));

        hub.dispatch(SessionEvent::DisconnectRequested);
        remove_partial(&partial);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_handshake_timeout_when_sender_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(dir.path().to_path_buf());

        // Accepts TCP and the upgrade, but never acknowledges the hello.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let info = ConnectionInfo::new(vec![Candidate::new("127.0.0.1", port)])
            .unwrap()
            .with_selected(Candidate::new("127.0.0.1", port))
            .unwrap();
        client.connect(info).await;

        assert!(matches!(
            client.status(),
            TransferStatus::Error {
                reason: FailureReason::Transfer(TransferError::HandshakeTimeout(2))
            }
        ));
        server.abort();
    }
}

//! Sender side of the Landrop protocol.
//!
//! [`LandropSender`] listens for one receiver and streams a single archive
//! to it. Connections that never complete the WebSocket upgrade or the hello
//! exchange (such as reachability probes) are skipped and the sender keeps
//! listening.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::Config;
use crate::connection::{Candidate, ConnectionInfo};
use crate::error::{Error, Result};
use crate::protocol::{ControlMessage, Frame};

/// How long a graceful close may take after the last frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender settings.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Name sent in `hello-ack`
    pub device_name: String,
    /// Bytes per binary frame
    pub chunk_size: usize,
    /// Time a receiver has to send `hello` after connecting
    pub handshake_timeout: Duration,
}

impl SenderConfig {
    /// Derive sender settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_name: config.general.device_name.clone(),
            chunk_size: config.transfer.chunk_size,
            handshake_timeout: config.network.connect_timeout,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            device_name: "landrop-sender".to_string(),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// Receiver address
    pub peer: SocketAddr,
    /// Receiver device name
    pub receiver: String,
    /// File name announced to the receiver
    pub filename: String,
    /// Bytes sent
    pub bytes: u64,
    /// Binary frames sent
    pub chunks: usize,
}

/// A listening sender.
#[derive(Debug)]
pub struct LandropSender {
    listener: TcpListener,
    config: SenderConfig,
}

impl LandropSender {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, config: SenderConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Landrop sender listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Payload describing this sender, for a QR code.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let addr = self.local_addr()?;
        let candidates = if addr.ip().is_unspecified() {
            local_candidates(addr.port())
        } else {
            vec![Candidate::new(addr.ip().to_string(), addr.port())]
        };
        ConnectionInfo::new(candidates)
    }

    /// Wait for a receiver and stream `path` to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the socket fails after
    /// the handshake.
    pub async fn serve_file(&self, path: &Path) -> Result<SendReport> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidBackup(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let filename = path
            .file_name()
            .map_or_else(|| "backup.zip".to_string(), |n| n.to_string_lossy().into_owned());

        let (mut ws, peer, receiver) = self.accept_receiver().await?;
        tracing::info!("Receiver '{receiver}' connected from {peer}");

        let result = self
            .stream_file(&mut ws, path, &filename, metadata.len())
            .await;
        let (bytes, chunks) = match result {
            Ok(sent) => sent,
            Err(e) => {
                let abort = ControlMessage::Abort {
                    reason: e.to_string(),
                };
                if let Ok(message) = abort.to_message() {
                    let _ = ws.send(message).await;
                }
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        close_gracefully(&mut ws).await;
        tracing::info!("Sent '{filename}' ({bytes} bytes in {chunks} chunks) to {peer}");

        Ok(SendReport {
            peer,
            receiver,
            filename,
            bytes,
            chunks,
        })
    }

    async fn accept_receiver(&self) -> Result<(WebSocketStream<TcpStream>, SocketAddr, String)> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::debug!("Incoming connection from {peer}");

            match tokio::time::timeout(self.config.handshake_timeout, self.handshake(stream)).await
            {
                Ok(Ok((ws, receiver))) => return Ok((ws, peer, receiver)),
                Ok(Err(e)) => tracing::debug!("Connection from {peer} skipped: {e}"),
                Err(_) => tracing::debug!("Connection from {peer} timed out before hello"),
            }
        }
    }

    async fn handshake(&self, stream: TcpStream) -> Result<(WebSocketStream<TcpStream>, String)> {
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::ProtocolError(format!("upgrade failed: {e}")))?;

        while let Some(message) = ws.next().await {
            let message = message.map_err(|e| Error::ProtocolError(e.to_string()))?;
            match Frame::decode(message)? {
                Frame::Control(ControlMessage::Hello {
                    device_name,
                    protocol_version,
                }) => {
                    if protocol_version != crate::PROTOCOL_VERSION {
                        tracing::warn!(
                            "Receiver '{device_name}' speaks protocol {protocol_version}, \
                             expected {}",
                            crate::PROTOCOL_VERSION
                        );
                    }
                    let ack = ControlMessage::HelloAck {
                        device_name: self.config.device_name.clone(),
                    };
                    send(&mut ws, ack.to_message()?).await?;
                    return Ok((ws, device_name));
                }
                Frame::Close => break,
                other => tracing::debug!("Ignoring {other:?} before hello"),
            }
        }
        Err(Error::ProtocolError(
            "connection closed before hello".to_string(),
        ))
    }

    async fn stream_file(
        &self,
        ws: &mut WebSocketStream<TcpStream>,
        path: &Path,
        filename: &str,
        total_size: u64,
    ) -> Result<(u64, usize)> {
        let start = ControlMessage::ZipFileStart {
            filename: filename.to_string(),
            total_size,
        };
        send(ws, start.to_message()?).await?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        let mut bytes = 0u64;
        let mut chunks = 0usize;

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            send(ws, Message::Binary(buffer[..n].to_vec())).await?;
            bytes += n as u64;
            chunks += 1;
            tracing::trace!("Sent chunk {chunks} ({n} bytes)");
        }

        send(ws, ControlMessage::ZipFileEnd.to_message()?).await?;
        Ok((bytes, chunks))
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, message: Message) -> Result<()> {
    ws.send(message)
        .await
        .map_err(|e| Error::ProtocolError(format!("send failed: {e}")))
}

/// Answer pings until the receiver closes, then close our side.
async fn close_gracefully(ws: &mut WebSocketStream<TcpStream>) {
    let drain = async {
        let _ = ws.close(None).await;
        while let Some(Ok(message)) = ws.next().await {
            if let Ok(Frame::Control(ControlMessage::Ping)) = Frame::decode(message) {
                if let Ok(pong) = ControlMessage::Pong.to_message() {
                    let _ = ws.send(pong).await;
                }
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
        tracing::debug!("Receiver did not acknowledge close in time");
    }
}

/// Candidate endpoints for this machine, preferred first.
///
/// The primary LAN address is found by connecting a UDP socket, which sends
/// no packets. Loopback is always listed last.
#[must_use]
pub fn local_candidates(port: u16) -> Vec<Candidate> {
    let mut ips: Vec<IpAddr> = Vec::new();

    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(local_addr) = socket.local_addr() {
                if !local_addr.ip().is_loopback() && !local_addr.ip().is_unspecified() {
                    ips.push(local_addr.ip());
                }
            }
        }
    }
    ips.push(IpAddr::from([127, 0, 0, 1]));

    ips.into_iter()
        .map(|ip| Candidate::new(ip.to_string(), port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_candidates_end_with_loopback() {
        let candidates = local_candidates(7017);
        assert!(!candidates.is_empty());
        let last = candidates.last().unwrap();
        assert_eq!(last.host, "127.0.0.1");
        assert!(candidates.iter().all(|c| c.port == 7017));
    }

    #[tokio::test]
    async fn test_connection_info_for_specific_address() {
        let sender = LandropSender::bind("127.0.0.1:0".parse().unwrap(), SenderConfig::default())
            .await
            .unwrap();
        let port = sender.local_addr().unwrap().port();

        let info = sender.connection_info().unwrap();
        assert_eq!(info.candidates(), &[Candidate::new("127.0.0.1", port)]);
    }

    #[tokio::test]
    async fn test_serve_rejects_missing_file() {
        let sender = LandropSender::bind("127.0.0.1:0".parse().unwrap(), SenderConfig::default())
            .await
            .unwrap();
        let err = sender
            .serve_file(Path::new("/definitely/not/here.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_probe_connections_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.zip");
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let config = SenderConfig {
            chunk_size: 4,
            ..SenderConfig::default()
        };
        let sender = LandropSender::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let addr = sender.local_addr().unwrap();

        let client = tokio::spawn(async move {
            // A bare probe that never upgrades.
            drop(TcpStream::connect(addr).await.unwrap());

            let url = format!("ws://{addr}{}", crate::LANDROP_WS_PATH);
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            let hello = ControlMessage::Hello {
                device_name: "phone".to_string(),
                protocol_version: crate::PROTOCOL_VERSION,
            };
            ws.send(hello.to_message().unwrap()).await.unwrap();

            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match Frame::decode(message).unwrap() {
                    Frame::Chunk(bytes) => received.extend(bytes),
                    Frame::Control(ControlMessage::ZipFileEnd) | Frame::Close => break,
                    _ => {}
                }
            }
            received
        });

        let report = sender.serve_file(&path).await.unwrap();
        assert_eq!(report.receiver, "phone");
        assert_eq!(report.bytes, 10);
        assert_eq!(report.chunks, 3);
        assert_eq!(client.await.unwrap(), vec![7u8; 10]);
    }
}

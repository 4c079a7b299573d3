//! Connection descriptors scanned from the sender's QR code.
//!
//! The sender advertises every address it can be reached on. The payload is
//! a JSON object:
//!
//! ```json
//! { "candidates": [ { "host": "192.168.1.20", "port": 7017 }, { "host": "10.0.0.4", "port": 7017 } ] }
//! ```
//!
//! Older senders encode a single host as a plain string (`192.168.1.20`,
//! `192.168.1.20:7017`, `[fe80::1]:7017` or `ws://192.168.1.20:7017`). Both
//! forms normalize into a [`ConnectionInfo`] with an ordered candidate list.
//! [`resolver::CandidateResolver`] then picks the host to connect to.

pub mod resolver;

pub use resolver::{CandidateResolver, Prober, TcpProber};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One network endpoint the sender may be reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// IP literal or hostname
    pub host: String,
    /// TCP port of the sender's WebSocket server
    pub port: u16,
}

impl Candidate {
    /// Create a candidate.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a host string, falling back to `default_port` when it carries none.
    ///
    /// Accepts formats:
    /// - `IP` (e.g., `192.168.1.100`)
    /// - `IP:PORT` (e.g., `192.168.1.100:7017`)
    /// - `[IPv6]` and `[IPv6]:PORT` (e.g., `[::1]:7017`)
    /// - `hostname` and `hostname:PORT` (e.g., `laptop.local:7017`)
    ///
    /// # Examples
    ///
    /// ```
    /// use landrop_core::connection::Candidate;
    ///
    /// let candidate = Candidate::parse("192.168.1.100", 7017).unwrap();
    /// assert_eq!(candidate.port, 7017);
    ///
    /// let candidate = Candidate::parse("[::1]:9000", 7017).unwrap();
    /// assert_eq!(candidate.host, "::1");
    /// assert_eq!(candidate.port, 9000);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the host string cannot be parsed.
    pub fn parse(host: &str, default_port: u16) -> Result<Self> {
        let host = host.trim();
        let invalid = || {
            Error::InvalidPayload(format!(
                "invalid host '{host}', expected IP, IP:PORT or HOSTNAME:PORT"
            ))
        };

        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(Self::new(addr.ip().to_string(), addr.port()));
        }

        if host.starts_with('[') && host.ends_with(']') {
            let ip: IpAddr = host[1..host.len() - 1].parse().map_err(|_| invalid())?;
            return Ok(Self::new(ip.to_string(), default_port));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), default_port));
        }

        let (name, port) = match host.rsplit_once(':') {
            Some((name, port_part)) if !name.contains(':') => {
                let port: u16 = port_part.parse().map_err(|_| {
                    Error::InvalidPayload(format!(
                        "invalid port '{port_part}', must be a number between 1 and 65535"
                    ))
                })?;
                (name, port)
            }
            Some(_) => return Err(invalid()),
            None => (host, default_port),
        };

        if !is_hostname(name) {
            return Err(invalid());
        }
        if port == 0 {
            return Err(Error::InvalidPayload("port 0 is not reachable".to_string()));
        }

        Ok(Self::new(name, port))
    }

    /// `host:port` with IPv6 hosts bracketed, suitable for URLs.
    #[must_use]
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// WebSocket URL of the sender's Landrop endpoint.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("ws://{}{}", self.authority(), crate::LANDROP_WS_PATH)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Hostnames are restricted to DNS label characters; anything else in a
/// scanned payload is garbage rather than a host.
fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
        && name.chars().any(|c| c.is_ascii_alphabetic())
}

/// Candidate endpoints scanned from a sender, plus the host chosen among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    candidates: Vec<Candidate>,
    selected_host: Option<Candidate>,
    legacy: bool,
}

#[derive(Deserialize)]
struct PayloadWire {
    candidates: Vec<CandidateWire>,
}

#[derive(Deserialize)]
struct CandidateWire {
    host: String,
    port: Option<u16>,
}

impl ConnectionInfo {
    /// Build from an explicit candidate list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if `candidates` is empty.
    pub fn new(candidates: Vec<Candidate>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(Error::InvalidPayload(
                "payload contains no connection candidates".to_string(),
            ));
        }
        Ok(Self {
            candidates,
            selected_host: None,
            legacy: false,
        })
    }

    /// Parse the text of a scanned QR code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the payload is neither a
    /// candidate object nor a legacy host string.
    pub fn from_payload(payload: &str, default_port: u16) -> Result<Self> {
        let payload = payload.trim();

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Object(_)) => {
                let wire: PayloadWire = serde_json::from_str(payload)
                    .map_err(|e| Error::InvalidPayload(e.to_string()))?;
                let candidates = wire
                    .candidates
                    .into_iter()
                    .map(|c| match c.port {
                        Some(0) => Err(Error::InvalidPayload(format!(
                            "candidate '{}' has port 0",
                            c.host
                        ))),
                        Some(port) => Candidate::parse(&c.host, port)
                            .map(|parsed| Candidate::new(parsed.host, port)),
                        None => Candidate::parse(&c.host, default_port),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::new(candidates)
            }
            Ok(serde_json::Value::String(host)) => Self::from_legacy(&host, default_port),
            Ok(_) => Err(Error::InvalidPayload(
                "expected a candidate object or a host string".to_string(),
            )),
            Err(_) => Self::from_legacy(payload, default_port),
        }
    }

    fn from_legacy(host: &str, default_port: u16) -> Result<Self> {
        let host = host.trim();
        let host = host
            .strip_prefix("ws://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host);
        let host = host.split_once('/').map_or(host, |(authority, _)| authority);

        let candidate = Candidate::parse(host, default_port)?;
        tracing::debug!("Normalized legacy payload to candidate {candidate}");

        let mut info = Self::new(vec![candidate])?;
        info.legacy = true;
        Ok(info)
    }

    /// Ordered candidate list.
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// The resolved host, if resolution already happened.
    #[must_use]
    pub fn selected_host(&self) -> Option<&Candidate> {
        self.selected_host.as_ref()
    }

    /// Whether the payload used the single-host legacy format.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Consume this descriptor, returning one with `host` selected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if `host` is not one of the candidates.
    pub fn with_selected(mut self, host: Candidate) -> Result<Self> {
        if !self.candidates.contains(&host) {
            return Err(Error::InvalidPayload(format!(
                "{host} is not one of the scanned candidates"
            )));
        }
        self.selected_host = Some(host);
        Ok(self)
    }
}

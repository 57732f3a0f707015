//! Pillbox discovery over UDP broadcast.
//!
//! The host broadcasts an ASCII query token on the discovery port and the
//! pillbox answers with a JSON identification document:
//!
//! ```text
//! {"device":"ESP32-Pillbox","ip":"192.168.4.1","port":8080,"boxes":10,"time":"..."}
//! ```
//!
//! No reply and malformed replies are retried after a fixed delay. A
//! socket-level failure (no interface, permission denied) ends discovery
//! immediately since retrying will not change the environment.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pillbox_core::config::{DiscoveryConfig, PillboxConfig, DEFAULT_PILLBOX_PORT};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Identification reply from the pillbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    #[serde(rename = "device")]
    pub device_name: String,
    #[serde(rename = "ip")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(rename = "boxes", default)]
    pub compartment_count: u32,
    #[serde(rename = "time", default)]
    pub device_time: String,
}

fn default_port() -> u16 {
    DEFAULT_PILLBOX_PORT
}

impl DiscoveryReply {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Discovery error.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("No pillbox found after {attempts} attempt(s)")]
    NotFound { attempts: u32 },
}

/// Why a single reply was rejected.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReplyError {
    #[error("reply is not UTF-8")]
    Encoding,
    #[error("invalid JSON reply: {0}")]
    Json(String),
    #[error("unexpected device kind '{0}'")]
    WrongDevice(String),
    #[error("invalid address '{0}'")]
    Address(String),
}

/// Validate a raw reply datagram.
///
/// A missing or empty `ip` falls back to the datagram's source address.
pub fn parse_reply(
    bytes: &[u8],
    source: SocketAddr,
    expected_device: &str,
) -> Result<DiscoveryReply, ReplyError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ReplyError::Encoding)?;
    let value: serde_json::Value =
        serde_json::from_str(text.trim()).map_err(|e| ReplyError::Json(e.to_string()))?;

    let device = value
        .get("device")
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    if device != expected_device {
        return Err(ReplyError::WrongDevice(device.to_string()));
    }

    let address = match value.get("ip").and_then(|ip| ip.as_str()) {
        Some(ip) if !ip.trim().is_empty() => ip
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ReplyError::Address(ip.to_string()))?,
        _ => source.ip(),
    };

    let port = match value.get("port") {
        None | Some(serde_json::Value::Null) => DEFAULT_PILLBOX_PORT,
        Some(p) => p
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ReplyError::Json(format!("invalid port {}", p)))?,
    };

    Ok(DiscoveryReply {
        device_name: device.to_string(),
        address,
        port,
        compartment_count: value.get("boxes").and_then(|b| b.as_u64()).unwrap_or(0) as u32,
        device_time: value
            .get("time")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

/// One broadcast-and-wait exchange.
#[async_trait]
pub trait BroadcastProbe: Send + Sync {
    /// Send `query` and wait up to `wait` for a single datagram.
    ///
    /// `Ok(None)` means nothing arrived in time; `Err` is a socket failure.
    async fn probe(
        &self,
        query: &[u8],
        wait: Duration,
    ) -> std::io::Result<Option<(Vec<u8>, SocketAddr)>>;
}

/// Probe over a fresh broadcast-enabled UDP socket per attempt.
#[derive(Debug, Clone)]
pub struct UdpBroadcastProbe {
    target: SocketAddr,
}

impl UdpBroadcastProbe {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }

    pub fn from_config(config: &DiscoveryConfig) -> std::io::Result<Self> {
        let ip: IpAddr = config.broadcast_address.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid broadcast address '{}'", config.broadcast_address),
            )
        })?;
        Ok(Self::new(SocketAddr::new(ip, config.udp_port)))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait]
impl BroadcastProbe for UdpBroadcastProbe {
    async fn probe(
        &self,
        query: &[u8],
        wait: Duration,
    ) -> std::io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let bind: SocketAddr = match self.target {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        socket.send_to(query, self.target).await?;
        debug!(target = %self.target, "Sent discovery broadcast");

        let mut buf = [0u8; 1024];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => Ok(Some((buf[..n].to_vec(), from))),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

/// Locates the pillbox on the local network.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    probe: Arc<dyn BroadcastProbe>,
}

impl DiscoveryService {
    /// Service broadcasting on the configured address and port.
    pub fn new(config: &DiscoveryConfig) -> std::io::Result<Self> {
        let probe = UdpBroadcastProbe::from_config(config)?;
        Ok(Self::with_probe(config, Arc::new(probe)))
    }

    pub fn with_probe(config: &DiscoveryConfig, probe: Arc<dyn BroadcastProbe>) -> Self {
        Self {
            config: config.clone(),
            probe,
        }
    }

    /// Discover with the configured timeout and retry count.
    pub async fn discover(&self) -> Result<DiscoveryReply, DiscoveryError> {
        self.discover_with(self.config.timeout(), self.config.max_retries)
            .await
    }

    /// Broadcast up to `max_retries` times, waiting `timeout` for a reply
    /// each time and the configured retry delay between attempts.
    pub async fn discover_with(
        &self,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<DiscoveryReply, DiscoveryError> {
        let attempts = max_retries.max(1);
        let query = self.config.query.as_bytes();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay()).await;
                info!(attempt, max = attempts, "Retrying pillbox discovery");
            }

            match self.probe.probe(query, timeout).await {
                Ok(Some((bytes, source))) => {
                    match parse_reply(&bytes, source, &self.config.device_kind) {
                        Ok(reply) => {
                            info!(
                                addr = %reply.socket_addr(),
                                boxes = reply.compartment_count,
                                time = %reply.device_time,
                                "Found pillbox"
                            );
                            return Ok(reply);
                        }
                        Err(e) => warn!(attempt, from = %source, "Ignoring discovery reply: {}", e),
                    }
                }
                Ok(None) => debug!(attempt, "No discovery reply (timeout)"),
                Err(e) => {
                    warn!(attempt, "Discovery socket error, giving up: {}", e);
                    return Err(DiscoveryError::NotFound { attempts: attempt });
                }
            }
        }

        warn!(attempts, "Pillbox not found");
        Err(DiscoveryError::NotFound { attempts })
    }

    /// Discover, persisting a hit to `path`; on a miss fall back to the
    /// address saved by an earlier run.
    pub async fn discover_or_fallback(
        &self,
        config: &mut PillboxConfig,
        path: Option<&Path>,
    ) -> Option<(String, u16)> {
        match self.discover().await {
            Ok(reply) => {
                let ip = reply.address.to_string();
                if let Some(path) = path {
                    if let Err(e) = config.remember_device(path, &ip, reply.port) {
                        warn!("Failed to save discovered address: {}", e);
                    }
                }
                Some((ip, reply.port))
            }
            Err(e) => {
                let fallback = config.fallback_address();
                match &fallback {
                    Some((ip, port)) => info!(ip = %ip, port, "{}; using saved address", e),
                    None => warn!("{}; no saved address either", e),
                }
                fallback
            }
        }
    }
}

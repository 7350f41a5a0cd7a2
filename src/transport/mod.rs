//! Transport layer for the session engine
//!
//! The session never touches sockets directly. It talks to a [`Transport`]
//! that moves raw MQTT frames and reports what happened on the link as
//! [`TransportEvent`]s. [`TcpTransport`] is the production adapter; tests
//! substitute the in-memory broker from [`crate::testing`].

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;
pub mod tcp;

pub use tcp::TcpTransport;

/// Where and how to open the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub ca_path: Option<PathBuf>,
    pub verify_ssl: bool,
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            ca_path: None,
            verify_ssl: true,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Something that happened on the link during [`Transport::drive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link finished opening
    Connected,
    /// The link is gone; the handle must be reopened before use
    Disconnected(String),
    /// Raw bytes read from the link, not necessarily frame aligned
    FrameReceived(Bytes),
    /// A previous send returned [`SendStatus::WouldBlock`] and may be retried
    WriteReady,
}

/// Outcome of a non-blocking send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// Nothing was written; retry after [`TransportEvent::WriteReady`]
    WouldBlock,
}

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open {address}: {reason}")]
    Open { address: String, reason: String },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport is not open")]
    NotOpen,
    #[error("Keep-alive timeout: no PINGRESP within {0:?}")]
    KeepAliveTimeout(Duration),
    #[error("Connect timeout: no CONNACK within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Link closed: {0}")]
    Closed(String),
}

/// Connection primitives consumed by the session.
///
/// Only [`drive`](Transport::drive) may wait on I/O and it must return within
/// `timeout`. It must also be cancel-safe: the session races it against
/// outbound wake-ups and drops the future when new frames are queued, so no
/// read data may be lost when that happens.
#[async_trait]
pub trait Transport: Send {
    /// Open the link. A new open on an already open handle replaces it.
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Tear the link down; idempotent
    async fn close(&mut self);

    /// Queue one complete frame for transmission
    async fn send_frame(&mut self, frame: &[u8]) -> Result<SendStatus, TransportError>;

    /// Wait up to `timeout` for link activity
    async fn drive(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        let endpoint = Endpoint::plain("broker.local", 1883);
        assert_eq!(endpoint.address(), "broker.local:1883");
        assert!(!endpoint.tls);
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::Open {
                address: "h:1".to_string(),
                reason: "refused".to_string(),
            },
            TransportError::NotOpen,
            TransportError::KeepAliveTimeout(Duration::from_secs(10)),
            TransportError::Closed("eof".to_string()),
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
        assert!(TransportError::KeepAliveTimeout(Duration::from_secs(10))
            .to_string()
            .contains("PINGRESP"));
    }
}

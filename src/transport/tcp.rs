//! TCP and TLS transport on tokio
//!
//! Outbound frames are staged in a bounded write buffer and written out by
//! [`drive`](Transport::drive), which keeps [`send_frame`](Transport::send_frame)
//! non-blocking. Once the buffer passes its high-water mark, sends report
//! [`SendStatus::WouldBlock`] until a drain emits [`TransportEvent::WriteReady`].

use super::{Endpoint, SendStatus, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;
const WRITE_HIGH_WATER: usize = 64 * 1024;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Plain TCP or TLS stream
enum LinkStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LinkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LinkStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LinkStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LinkStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LinkStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Production transport: tokio TCP, optionally wrapped in rustls
pub struct TcpTransport {
    stream: Option<LinkStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_blocked: bool,
    announce_connected: bool,
    tls_connector: Option<TlsConnector>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            write_blocked: false,
            announce_connected: false,
            tls_connector: None,
        }
    }

    fn connector(&mut self, endpoint: &Endpoint) -> Result<TlsConnector, TransportError> {
        if let Some(connector) = &self.tls_connector {
            return Ok(connector.clone());
        }
        let config = build_tls_config(endpoint)?;
        let connector = TlsConnector::from(Arc::new(config));
        self.tls_connector = Some(connector.clone());
        Ok(connector)
    }

    fn drop_link(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.write_blocked = false;
        self.announce_connected = false;
    }

    fn link_lost(&mut self, reason: String, events: &mut Vec<TransportEvent>) {
        warn!(target: "iotlink::transport", reason = %reason, "link lost");
        self.drop_link();
        events.push(TransportEvent::Disconnected(reason));
    }

    /// Write as much of the staged buffer as the socket takes before `deadline`
    async fn flush_staged(&mut self, deadline: Instant, events: &mut Vec<TransportEvent>) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if self.write_buf.is_empty() {
            return;
        }

        let staged = &self.write_buf;
        let result = tokio::time::timeout_at(deadline, async {
            let written = stream.write(staged).await?;
            stream.flush().await?;
            Ok::<usize, io::Error>(written)
        })
        .await;

        match result {
            Ok(Ok(0)) => self.link_lost("write returned zero bytes".to_string(), events),
            Ok(Ok(written)) => {
                self.write_buf.advance(written);
                if self.write_blocked && self.write_buf.len() < WRITE_HIGH_WATER / 2 {
                    self.write_blocked = false;
                    events.push(TransportEvent::WriteReady);
                }
            }
            Ok(Err(e)) => self.link_lost(format!("write failed: {e}"), events),
            Err(_) => {}
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.drop_link();
        let address = endpoint.address();
        info!(target: "iotlink::transport", address = %address, tls = endpoint.tls, "opening link");

        let tcp = tokio::time::timeout(endpoint.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::Open {
                address: address.clone(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| TransportError::Open {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        let stream = if endpoint.tls {
            let connector = self.connector(endpoint)?;
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|_| TransportError::Tls(format!("invalid server name: {}", endpoint.host)))?;
            let tls = tokio::time::timeout(endpoint.connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| TransportError::Tls("handshake timed out".to_string()))?
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            LinkStream::Tls(Box::new(tls))
        } else {
            LinkStream::Plain(tcp)
        };

        self.stream = Some(stream);
        self.announce_connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if !self.write_buf.is_empty() {
                let staged = self.write_buf.split();
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, stream.write_all(&staged)).await;
            }
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, stream.shutdown()).await;
            debug!(target: "iotlink::transport", "link closed");
        }
        self.drop_link();
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<SendStatus, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotOpen);
        }
        if !self.write_buf.is_empty() && self.write_buf.len() + frame.len() > WRITE_HIGH_WATER {
            self.write_blocked = true;
            return Ok(SendStatus::WouldBlock);
        }
        self.write_buf.extend_from_slice(frame);
        Ok(SendStatus::Sent)
    }

    async fn drive(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();

        if self.announce_connected {
            self.announce_connected = false;
            events.push(TransportEvent::Connected);
        }

        self.flush_staged(deadline, &mut events).await;

        let Some(stream) = self.stream.as_mut() else {
            if events.is_empty() {
                tokio::time::sleep_until(deadline).await;
            }
            return events;
        };

        // Return promptly if there is already something to report
        let read_deadline = if events.is_empty() {
            deadline
        } else {
            Instant::now()
        };

        self.read_buf.reserve(READ_CHUNK);
        match tokio::time::timeout_at(read_deadline, stream.read_buf(&mut self.read_buf)).await {
            Ok(Ok(0)) => self.link_lost("connection closed by broker".to_string(), &mut events),
            Ok(Ok(_)) => {
                let chunk = self.read_buf.split().freeze();
                events.push(TransportEvent::FrameReceived(chunk));
            }
            Ok(Err(e)) => self.link_lost(format!("read failed: {e}"), &mut events),
            Err(_) => {}
        }

        events
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Build the rustls client configuration for an endpoint
fn build_tls_config(endpoint: &Endpoint) -> Result<rustls::ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    if !endpoint.verify_ssl {
        warn!(target: "iotlink::transport", "broker certificate verification disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
            .with_no_client_auth());
    }

    let mut root_store = rustls::RootCertStore::empty();
    match &endpoint.ca_path {
        Some(ca_path) => {
            let file = File::open(ca_path)
                .map_err(|e| TransportError::Tls(format!("failed to open CA bundle: {e}")))?;
            let mut reader = BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TransportError::Tls(format!("failed to parse CA bundle: {e}")))?;
            if certs.is_empty() {
                return Err(TransportError::Tls(format!(
                    "no certificates in {}",
                    ca_path.display()
                )));
            }
            for cert in certs {
                root_store
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("failed to add CA cert: {e}")))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any broker certificate; only reachable with `verify_ssl = false`
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_endpoint() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::plain("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0xC0, 0x00]);
            socket.write_all(&[0xD0, 0x00]).await.unwrap();
            socket
        });

        let mut transport = TcpTransport::new();
        transport.open(&endpoint).await.unwrap();
        assert!(transport.is_open());
        assert_eq!(
            transport.send_frame(&[0xC0, 0x00]).await.unwrap(),
            SendStatus::Sent
        );

        let mut received = Vec::new();
        let mut saw_connected = false;
        for _ in 0..20 {
            for event in transport.drive(Duration::from_millis(100)).await {
                match event {
                    TransportEvent::Connected => saw_connected = true,
                    TransportEvent::FrameReceived(bytes) => received.extend_from_slice(&bytes),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            if received.len() >= 2 {
                break;
            }
        }

        assert!(saw_connected);
        assert_eq!(received, vec![0xD0, 0x00]);
        let _socket = server.await.unwrap();
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnected() {
        let (listener, endpoint) = local_endpoint().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::new();
        transport.open(&endpoint).await.unwrap();
        server.await.unwrap();

        let mut disconnected = false;
        for _ in 0..20 {
            let events = transport.drive(Duration::from_millis(100)).await;
            if events
                .iter()
                .any(|e| matches!(e, TransportEvent::Disconnected(_)))
            {
                disconnected = true;
                break;
            }
        }
        assert!(disconnected);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_failure() {
        let (listener, endpoint) = local_endpoint().await;
        drop(listener);

        let mut transport = TcpTransport::new();
        let result = transport.open(&endpoint).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn test_send_requires_open_link() {
        let mut transport = TcpTransport::new();
        assert!(matches!(
            transport.send_frame(&[0xC0, 0x00]).await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_missing_ca_bundle() {
        let mut endpoint = Endpoint::plain("broker.local", 8883);
        endpoint.tls = true;
        endpoint.ca_path = Some("/nonexistent/ca.pem".into());
        assert!(matches!(
            build_tls_config(&endpoint),
            Err(TransportError::Tls(_))
        ));
    }
}

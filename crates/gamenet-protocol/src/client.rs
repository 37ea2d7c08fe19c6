// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client helpers for dialing cluster nodes.
//!
//! One [`GamenetClient`] owns a single client endpoint and can connect to any
//! number of nodes. Callers keep the returned [`quinn::Connection`]s and run
//! unary calls or session streams on them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::envelope::{Envelope, StreamOpen};
use crate::frame::{Frame, FrameError, MessageType, is_closed_kind, read_frame, write_frame};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("could not resolve address: {0}")]
    Resolve(String),

    #[error("stream rejected by peer: {0}")]
    Rejected(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

impl ClientError {
    /// Whether the failure means the stream or connection is gone.
    pub fn is_closed(&self) -> bool {
        match self {
            ClientError::Frame(e) => e.is_closed(),
            ClientError::Io(e) => is_closed_kind(e.kind()),
            ClientError::ClosedStream(_) | ClientError::Connection(_) => true,
            ClientError::Write(e) => !matches!(e, quinn::WriteError::ZeroRttRejected),
            _ => false,
        }
    }
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct GamenetClientConfig {
    /// Server name for TLS verification (use "localhost" for local dev)
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for GamenetClientConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 120_000,
            connect_timeout_ms: 5_000,
        }
    }
}

/// QUIC client endpoint shared by every outgoing node connection
pub struct GamenetClient {
    endpoint: Endpoint,
    config: GamenetClientConfig,
}

impl GamenetClient {
    /// Create a new client with the given configuration
    pub fn new(config: GamenetClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint, config })
    }

    /// Create a client with default configuration for local development
    pub fn localhost() -> Result<Self, ClientError> {
        Self::new(GamenetClientConfig {
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    fn build_client_config(config: &GamenetClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        let idle: quinn::IdleTimeout = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| std::io::Error::other("idle timeout out of range"))?;
        transport.max_idle_timeout(Some(idle));

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Connect to a node at `addr` (`host:port`).
    #[instrument(skip(self))]
    pub async fn connect(&self, addr: &str) -> Result<Connection, ClientError> {
        let socket_addr = resolve(addr).await?;
        info!(%socket_addr, "connecting to node");

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self
            .endpoint
            .connect(socket_addr, &self.config.server_name)?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        debug!(%socket_addr, "connected to node");
        Ok(connection)
    }

    /// Close the endpoint and every connection on it
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"client closing");
    }
}

impl Drop for GamenetClient {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"client dropped");
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ClientError> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ClientError::Resolve(addr.to_string()))
}

/// Run one unary call on its own bidirectional stream.
pub async fn unary_call(conn: &Connection, request: &Envelope) -> Result<Envelope, ClientError> {
    let (mut send, mut recv) = conn.open_bi().await?;

    write_frame(&mut send, &Frame::request(request)?).await?;
    send.finish()?;

    let frame = read_frame(&mut recv).await?;
    match frame.message_type {
        MessageType::Response => Ok(frame.decode()?),
        MessageType::Error => {
            let env: Envelope = frame.decode()?;
            Err(ClientError::Rejected(env.error.unwrap_or_default()))
        }
        other => Err(FrameError::UnexpectedMessageType {
            expected: MessageType::Response,
            actual: other,
        }
        .into()),
    }
}

/// Open a session stream and send its metadata frame.
pub async fn open_session(
    conn: &Connection,
    open: &StreamOpen,
) -> Result<(SendStream, RecvStream), ClientError> {
    let (mut send, recv) = conn.open_bi().await?;
    write_frame(&mut send, &Frame::open(open)?).await?;
    Ok((send, recv))
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_all_fields() {
        let config = GamenetClientConfig::default();
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.keep_alive_interval_ms, 10_000);
        assert_eq!(config.idle_timeout_ms, 120_000);
        assert_eq!(config.connect_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_client_localhost() {
        let client = GamenetClient::localhost();
        assert!(
            client.is_ok(),
            "Failed to create localhost client: {:?}",
            client.err()
        );
    }

    #[tokio::test]
    async fn test_client_connect_timeout() {
        let client = GamenetClient::new(GamenetClientConfig {
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        // Nothing listens here, the handshake never completes
        let result = client.connect("127.0.0.1:59998").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").await.is_err());
        assert_eq!(
            resolve("127.0.0.1:7100").await.unwrap(),
            "127.0.0.1:7100".parse().unwrap()
        );
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout(5000);
        assert_eq!(format!("{}", err), "connection timed out after 5000ms");

        let err = ClientError::Resolve("nowhere:1".to_string());
        assert_eq!(format!("{}", err), "could not resolve address: nowhere:1");
    }

    #[test]
    fn test_closed_classification() {
        assert!(ClientError::Frame(FrameError::ConnectionClosed).is_closed());
        assert!(!ClientError::Timeout(1).is_closed());
        assert!(!ClientError::Rejected("bad uid".into()).is_closed());
    }

    #[test]
    fn test_build_client_config_no_keepalive() {
        let config = GamenetClientConfig {
            keep_alive_interval_ms: 0,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        };
        assert!(GamenetClient::build_client_config(&config).is_ok());
    }
}

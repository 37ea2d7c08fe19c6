// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for gamenet nodes.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Errors that can occur in the QUIC server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server closed")]
    Closed,
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct GamenetServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection
    pub max_bi_streams: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for GamenetServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7100)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 10_000,
            max_bi_streams: 10_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024, // 2MB
            udp_send_buffer_size: 2 * 1024 * 1024,    // 2MB
            max_concurrent_handlers: 0,               // unlimited by default
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl GamenetServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `GAMENET_QUIC_MAX_INCOMING`: Max pending handshakes (default: 10000)
    /// - `GAMENET_QUIC_MAX_BI_STREAMS`: Max bidirectional streams per connection (default: 10000)
    /// - `GAMENET_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 120000)
    /// - `GAMENET_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 15000)
    /// - `GAMENET_QUIC_UDP_RECV_BUFFER`: UDP receive buffer size in bytes (default: 2097152)
    /// - `GAMENET_QUIC_UDP_SEND_BUFFER`: UDP send buffer size in bytes (default: 2097152)
    /// - `GAMENET_QUIC_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_incoming: env_or("GAMENET_QUIC_MAX_INCOMING", default.max_incoming),
            max_bi_streams: env_or("GAMENET_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("GAMENET_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "GAMENET_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            udp_receive_buffer_size: env_or(
                "GAMENET_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "GAMENET_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
            max_concurrent_handlers: env_or(
                "GAMENET_QUIC_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
            ..default
        }
    }
}

/// QUIC server endpoint for a gamenet node
pub struct GamenetServer {
    endpoint: Endpoint,
    config: GamenetServerConfig,
}

impl GamenetServer {
    /// Create a new server with the given configuration
    pub fn new(config: GamenetServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            keep_alive_ms = config.keep_alive_interval_ms,
            max_handlers = config.max_concurrent_handlers,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Create a server with self-signed certificate and custom config
    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: GamenetServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();

        Self::new(config)
    }

    fn build_server_config(config: &GamenetServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        let idle: quinn::IdleTimeout = std::time::Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?;
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        // Nodes never use unidirectional streams
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(std::time::Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the server
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections until `shutdown` flips to `true` or the endpoint
    /// closes, handing each established connection to `handler` on its own
    /// task.
    #[instrument(skip(self, handler, shutdown))]
    pub async fn run<H, Fut>(
        &self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        use tokio::sync::Semaphore;

        // The flag may have flipped before this receiver was first polled
        if *shutdown.borrow_and_update() {
            info!("QUIC server stopped before accepting");
            self.close();
            return Ok(());
        }

        info!("QUIC server running");

        let semaphore = if self.config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_handlers as usize,
            )))
        } else {
            None
        };

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("QUIC server received shutdown signal");
                        self.close();
                        break;
                    }
                }

                incoming = self.accept() => {
                    let Some(incoming) = incoming else {
                        break;
                    };
                    let handler = handler.clone();
                    let semaphore = semaphore.clone();

                    tokio::spawn(async move {
                        let _permit = if let Some(ref sem) = semaphore {
                            match sem.clone().acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    warn!("semaphore closed, dropping connection");
                                    return;
                                }
                            }
                        } else {
                            None
                        };

                        match incoming.await {
                            Ok(connection) => {
                                let remote_addr = connection.remote_address();
                                debug!(%remote_addr, "accepted connection");
                                handler(ConnectionHandler::new(connection)).await;
                            }
                            Err(e) => {
                                warn!("failed to accept connection: {}", e);
                            }
                        }
                    });
                }
            }
        }

        info!("QUIC server stopped");
        Ok(())
    }
}

/// Handler for an individual QUIC connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    /// Get the remote address of the connection
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Run the connection, spawning `handler` for every bidirectional stream
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.connection.accept_bi().await.map_err(ServerError::from) {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(e) => {
                    match &e {
                        ServerError::Connection(quinn::ConnectionError::ApplicationClosed(_))
                        | ServerError::Connection(quinn::ConnectionError::LocallyClosed)
                        | ServerError::Connection(quinn::ConnectionError::TimedOut) => {
                            debug!("connection closed");
                        }
                        _ => {
                            error!("error accepting stream: {}", e);
                        }
                    }
                    break;
                }
            }
        }
    }
}

/// Handler for an individual QUIC stream (bidirectional)
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Finish the send stream (signal no more data)
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))?;
        Ok(())
    }

    /// Split into the raw halves, read half first
    pub fn into_parts(self) -> (RecvStream, SendStream) {
        (self.recv, self.send)
    }
}

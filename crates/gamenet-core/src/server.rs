// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC server: accepts streams and routes envelopes to the registry.
//!
//! Every bidirectional stream is classified by its first frame:
//!
//! | First frame | Path |
//! |-------------|------|
//! | `Request` | unary call, one reply then the stream is finished |
//! | `Open` | session stream, see [`session`] |
//! | anything else | rejected with an `Error` frame |
//!
//! The server is transport-agnostic: [`RpcServer::serve_stream`] works on any
//! `AsyncRead`/`AsyncWrite` pair. [`RpcServer::serve`] plugs it into a QUIC
//! endpoint.

pub mod session;
pub mod unary;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gamenet_protocol::frame::read_frame;
use gamenet_protocol::server::{ConnectionHandler, GamenetServer, ServerError, StreamHandler};
use gamenet_protocol::{Envelope, Frame, MessageType, StreamOpen};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::registry::Registry;

/// Default depth of each connection's inbound frame queue.
pub const DEFAULT_STREAM_QUEUE: usize = 64;

/// Connected inter-node peers, by name.
///
/// Each entry carries the id of the connection that registered it so a
/// closing connection only removes its own entry, never a newer one that
/// reused the name.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, (Uuid, mpsc::Sender<Frame>)>>,
}

impl PeerTable {
    fn insert(&self, name: &str, id: Uuid, tx: mpsc::Sender<Frame>) {
        if let Ok(mut peers) = self.peers.lock()
            && let Some((old, _)) = peers.insert(name.to_string(), (id, tx))
        {
            debug!(peer = name, replaced = %old, "peer reconnected, replacing entry");
        }
    }

    fn remove(&self, name: &str, id: Uuid) -> bool {
        let Ok(mut peers) = self.peers.lock() else {
            return false;
        };
        match peers.get(name) {
            Some((current, _)) if *current == id => {
                peers.remove(name);
                true
            }
            _ => false,
        }
    }

    fn sender(&self, name: &str) -> Option<mpsc::Sender<Frame>> {
        self.peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(name).map(|(_, tx)| tx.clone()))
    }

    /// Names of the currently connected peers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .lock()
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// The receiving side of the cluster RPC layer.
pub struct RpcServer {
    name: String,
    registry: Arc<Registry>,
    peers: PeerTable,
    queue_depth: usize,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("name", &self.name)
            .field("peers", &self.peers.names())
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

impl RpcServer {
    pub fn new(name: impl Into<String>, registry: Arc<Registry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            registry,
            peers: PeerTable::default(),
            queue_depth: DEFAULT_STREAM_QUEUE,
            shutdown,
        }
    }

    /// Set the per-connection inbound queue depth (minimum 1).
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// This node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Send an unsolicited envelope to a connected peer.
    pub async fn push(&self, peer: &str, envelope: Envelope) -> Result<()> {
        let tx = self
            .peers
            .sender(peer)
            .ok_or_else(|| RpcError::NotFound(format!("peer '{peer}'")))?;
        let frame = Frame::push(&envelope)?;
        tx.send(frame).await.map_err(|_| RpcError::StreamClosed)
    }

    /// Ask every open session to close and stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Serve one accepted bidirectional stream until it ends.
    #[instrument(skip_all, fields(node = %self.name))]
    pub async fn serve_stream<R, W>(self: &Arc<Self>, mut reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let first = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if !e.is_closed() {
                    warn!(error = %e, "failed to read first frame");
                }
                return;
            }
        };

        match first.message_type {
            MessageType::Request => {
                unary::handle(&self.registry, first, &mut writer).await;
                let _ = writer.shutdown().await;
            }
            MessageType::Open => match first.decode::<StreamOpen>() {
                Ok(open) => session::run(self.clone(), open, reader, writer).await,
                Err(e) => {
                    let err = RpcError::InvalidMetadata(format!("undecodable open frame: {e}"));
                    session::reject(&mut writer, &err).await;
                }
            },
            other => {
                warn!(message_type = ?other, "unexpected first frame");
                let err = RpcError::TransportFailure(format!("unexpected first frame {other:?}"));
                session::reject(&mut writer, &err).await;
            }
        }
    }

    /// Accept QUIC connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// The shutdown subscription is taken here, before the returned future
    /// is first polled, so a shutdown issued right after spawning is seen.
    pub fn serve(
        self: Arc<Self>,
        server: GamenetServer,
    ) -> impl Future<Output = std::result::Result<(), ServerError>> + Send + 'static {
        let shutdown = self.shutdown.subscribe();
        self.serve_until(server, shutdown)
    }

    #[instrument(skip_all, fields(node = %self.name))]
    async fn serve_until(
        self: Arc<Self>,
        server: GamenetServer,
        shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<(), ServerError> {
        let addr = server.local_addr()?;
        info!(%addr, "RPC server starting");

        let this = self.clone();
        server
            .run(
                move |conn: ConnectionHandler| {
                    let this = this.clone();
                    async move {
                        handle_connection(conn, this).await;
                    }
                },
                shutdown,
            )
            .await
    }
}

#[instrument(skip(conn, server), fields(remote = %conn.remote_address()))]
async fn handle_connection(conn: ConnectionHandler, server: Arc<RpcServer>) {
    debug!("connection accepted");

    conn.run(move |stream: StreamHandler| {
        let server = server.clone();
        async move {
            let (recv, send) = stream.into_parts();
            server.serve_stream(recv, send).await;
        }
    })
    .await;

    debug!("connection closed");
}

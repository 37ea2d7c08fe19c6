// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side transport seams.
//!
//! The cluster client talks to nodes through two traits: a [`Dialer`] that
//! turns an address into a [`NodeConnection`], and the connection itself,
//! which runs unary calls and opens session streams. [`QuicDialer`] is the
//! production implementation; [`memory::MemoryDialer`] connects to servers in
//! the same process.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use gamenet_protocol::client::{open_session, unary_call};
use gamenet_protocol::frame::{read_frame, write_frame};
use gamenet_protocol::{Envelope, Frame, FrameError, GamenetClient, MessageType, StreamOpen};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

/// A `Push` frame received from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedEnvelope {
    pub node: String,
    pub envelope: Envelope,
}

/// Where a stream's background reader delivers `Push` frames.
#[derive(Debug, Clone)]
pub struct PushSink {
    node: String,
    tx: broadcast::Sender<PushedEnvelope>,
}

impl PushSink {
    pub fn new(node: impl Into<String>, tx: broadcast::Sender<PushedEnvelope>) -> Self {
        Self {
            node: node.into(),
            tx,
        }
    }

    fn deliver(&self, envelope: Envelope) {
        // No subscribers is fine; pushes are dropped then.
        let _ = self.tx.send(PushedEnvelope {
            node: self.node.clone(),
            envelope,
        });
    }
}

/// Tears down a session stream and its background reader.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Client half of a session stream.
///
/// Requests are written directly; a background task reads the other
/// direction, routing `Response` frames to [`recv`](Self::recv) and `Push`
/// frames to the push sink.
pub struct EnvelopeStream {
    writer: BoxWriter,
    responses: mpsc::Receiver<Result<Envelope>>,
    cancel: CancelHandle,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for EnvelopeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl EnvelopeStream {
    /// Wrap an already-opened stream (the `Open` frame has been written).
    pub fn spawn<R, W>(reader: R, writer: W, pushes: Option<PushSink>) -> (Self, CancelHandle)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cancel, cancel_rx) = CancelHandle::new();
        let (tx, responses) = mpsc::channel(16);
        let reader_task = tokio::spawn(read_loop(reader, tx, pushes, cancel_rx));

        let stream = Self {
            writer: Box::new(writer),
            responses,
            cancel: cancel.clone(),
            reader_task,
        };
        (stream, cancel)
    }

    /// Open a session on a fresh reader/writer pair: write the `Open` frame,
    /// then wrap it.
    pub async fn open<R, W>(
        reader: R,
        mut writer: W,
        open: &StreamOpen,
        pushes: Option<PushSink>,
    ) -> Result<(Self, CancelHandle)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        write_frame(&mut writer, &Frame::open(open)?).await?;
        Ok(Self::spawn(reader, writer, pushes))
    }

    /// Send one request. Fails with [`RpcError::StreamClosed`] if the stream
    /// was cancelled or the peer is gone.
    pub async fn send(&mut self, request: &Envelope) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::StreamClosed);
        }
        let frame = Frame::request(request)?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Wait for the next reply.
    pub async fn recv(&mut self) -> Result<Envelope> {
        match self.responses.recv().await {
            Some(result) => result,
            None => Err(RpcError::StreamClosed),
        }
    }

    /// Finish the send direction.
    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for EnvelopeStream {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    responses: mpsc::Sender<Result<Envelope>>,
    pushes: Option<PushSink>,
    mut cancel: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;

            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("stream cancelled");
                    return;
                }
                continue;
            }

            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                if !e.is_closed() {
                    let _ = responses.send(Err(e.into())).await;
                }
                return;
            }
        };

        match frame.message_type {
            MessageType::Response => {
                let decoded = frame.decode::<Envelope>().map_err(RpcError::from);
                if responses.send(decoded).await.is_err() {
                    return;
                }
            }
            MessageType::Push => match (frame.decode::<Envelope>(), &pushes) {
                (Ok(env), Some(sink)) => sink.deliver(env),
                (Ok(env), None) => {
                    debug!(method = %env.service_method, "dropping push, no sink")
                }
                (Err(e), _) => warn!(error = %e, "undecodable push frame"),
            },
            MessageType::Error => {
                let err = match frame.decode::<Envelope>() {
                    Ok(env) => RpcError::from_wire(
                        env.error_code.as_deref(),
                        env.error.unwrap_or_default(),
                    ),
                    Err(e) => e.into(),
                };
                warn!(error = %err, "stream rejected by node");
                let _ = responses.send(Err(err)).await;
                return;
            }
            other => warn!(message_type = ?other, "unexpected frame on client stream"),
        }
    }
}

/// Run one unary exchange on a fresh reader/writer pair.
pub async fn unary_exchange<R, W>(
    mut reader: R,
    mut writer: W,
    request: &Envelope,
) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(&mut writer, &Frame::request(request)?).await?;
    writer
        .shutdown()
        .await
        .map_err(|e| RpcError::from(FrameError::Io(e)))?;

    let frame = read_frame(&mut reader).await?;
    match frame.message_type {
        MessageType::Response => Ok(frame.decode()?),
        MessageType::Error => {
            let env: Envelope = frame.decode()?;
            Err(RpcError::from_wire(
                env.error_code.as_deref(),
                env.error.unwrap_or_default(),
            ))
        }
        other => Err(RpcError::TransportFailure(format!(
            "unexpected reply frame {other:?}"
        ))),
    }
}

/// An established connection to one node.
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// One unary round trip. The reply may carry an error envelope.
    async fn call(&self, request: Envelope) -> Result<Envelope>;

    /// Open a session stream with the given metadata.
    async fn open_stream(
        &self,
        open: StreamOpen,
        pushes: Option<PushSink>,
    ) -> Result<(EnvelopeStream, CancelHandle)>;

    /// Whether the connection is gone and must be redialed.
    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Creates connections to node addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn NodeConnection>>;
}

/// Dials nodes over QUIC.
pub struct QuicDialer {
    client: GamenetClient,
}

impl QuicDialer {
    pub fn new(client: GamenetClient) -> Self {
        Self { client }
    }

    /// Dialer for development clusters with self-signed certificates.
    pub fn localhost() -> Result<Self> {
        Ok(Self::new(GamenetClient::localhost()?))
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn NodeConnection>> {
        let conn = self
            .client
            .connect(addr)
            .await
            .map_err(|e| RpcError::TransportFailure(format!("dial {addr}: {e}")))?;
        Ok(Arc::new(QuicNodeConnection { conn }))
    }
}

/// One QUIC connection to a node.
pub struct QuicNodeConnection {
    conn: quinn::Connection,
}

#[async_trait]
impl NodeConnection for QuicNodeConnection {
    async fn call(&self, request: Envelope) -> Result<Envelope> {
        Ok(unary_call(&self.conn, &request).await?)
    }

    async fn open_stream(
        &self,
        open: StreamOpen,
        pushes: Option<PushSink>,
    ) -> Result<(EnvelopeStream, CancelHandle)> {
        let (send, recv) = open_session(&self.conn, &open).await?;
        Ok(EnvelopeStream::spawn(recv, send, pushes))
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn close(&self) {
        self.conn.close(0u32.into(), b"client closing");
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multiplexed session streams.
//!
//! A session stream starts with an `Open` frame carrying the connection
//! metadata and then carries any number of requests, each answered with
//! exactly one reply in request order. Inter-node peers also receive `Push`
//! frames on the same stream.
//!
//! ```text
//! Opening ──► Identifying ──► Active ──► Closing ──► Closed
//!                  │                        ▲
//!                  └── bad metadata ────────┘
//! ```
//!
//! Three tasks cooperate per stream: a receive pump feeding a bounded queue,
//! the dispatch loop (this task) and a single writer draining replies and
//! pushes.

use std::fmt;
use std::sync::Arc;

use gamenet_protocol::frame::{read_frame, write_frame};
use gamenet_protocol::{AGENT_NAME, Envelope, Frame, MessageType, Session, StreamOpen};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RpcServer;
use super::unary::reply_frame;
use crate::error::RpcError;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Opening,
    Identifying,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Opening => "opening",
            ConnState::Identifying => "identifying",
            ConnState::Active => "active",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Who is on the other end of a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// End-user connection forwarded by a gateway; every call runs with this
    /// session.
    Agent(Session),
    /// Another node, addressable for pushes under this name.
    Peer(String),
}

/// Derive the connection identity from its metadata.
pub fn identify(open: &StreamOpen) -> Result<Identity, RpcError> {
    let name = open
        .name()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RpcError::InvalidMetadata("missing 'name'".to_string()))?;

    if name != AGENT_NAME {
        return Ok(Identity::Peer(name.to_string()));
    }

    let uid = open
        .uid()
        .ok_or_else(|| RpcError::InvalidMetadata("agent connection without 'uid'".to_string()))?;
    let user_id = uid
        .parse::<u64>()
        .map_err(|_| RpcError::InvalidMetadata(format!("malformed uid '{uid}'")))?;
    Ok(Identity::Agent(Session::new(user_id)))
}

/// Refuse a stream with an `Error` frame and finish it.
pub(crate) async fn reject<W>(writer: &mut W, err: &RpcError)
where
    W: AsyncWrite + Unpin,
{
    if let Ok(frame) = Frame::error(&err.to_envelope("")) {
        let _ = write_frame(writer, &frame).await;
    }
    let _ = writer.shutdown().await;
}

fn transition(state: &mut ConnState, next: ConnState, conn: Uuid) {
    debug!(%conn, from = %state, to = %next, "session state");
    *state = next;
}

/// Drive one session stream to completion.
pub(crate) async fn run<R, W>(server: Arc<RpcServer>, open: StreamOpen, reader: R, mut writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = Uuid::new_v4();
    let mut state = ConnState::Opening;
    transition(&mut state, ConnState::Identifying, conn_id);

    let identity = match identify(&open) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(conn = %conn_id, error = %e, "rejecting session stream");
            reject(&mut writer, &e).await;
            transition(&mut state, ConnState::Closed, conn_id);
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::channel::<Frame>(server.queue_depth);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let (in_tx, mut in_rx) = mpsc::channel::<Frame>(server.queue_depth);
    let pump = tokio::spawn(receive_pump(reader, in_tx));

    let session = match &identity {
        Identity::Agent(session) => {
            info!(conn = %conn_id, user_id = session.user_id, "agent session opened");
            Some(*session)
        }
        Identity::Peer(name) => {
            server.peers.insert(name, conn_id, out_tx.clone());
            info!(conn = %conn_id, peer = %name, "peer session opened");
            None
        }
    };
    transition(&mut state, ConnState::Active, conn_id);

    let mut shutdown = server.shutdown.subscribe();
    let mut handled: u64 = 0;
    if !*shutdown.borrow_and_update() {
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(conn = %conn_id, "server shutting down, closing session");
                        break;
                    }
                }

                frame = in_rx.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let Some(reply) = dispatch_frame(&server.registry, session, frame).await else {
                        continue;
                    };
                    handled += 1;
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    transition(&mut state, ConnState::Closing, conn_id);
    if let Identity::Peer(name) = &identity
        && !server.peers.remove(name, conn_id)
    {
        debug!(conn = %conn_id, peer = %name, "peer entry already replaced");
    }
    in_rx.close();
    pump.abort();
    drop(out_tx);
    let _ = writer_task.await;

    transition(&mut state, ConnState::Closed, conn_id);
    info!(conn = %conn_id, handled, "session closed");
}

/// Dispatch one inbound frame, returning the reply frame for requests.
async fn dispatch_frame(
    registry: &Registry,
    conn_session: Option<Session>,
    frame: Frame,
) -> Option<Frame> {
    if frame.message_type != MessageType::Request {
        warn!(
            message_type = ?frame.message_type,
            "ignoring non-request frame on session stream"
        );
        return None;
    }

    let env = match frame.decode::<Envelope>() {
        Ok(env) => env,
        Err(e) => return reply_frame(RpcError::DecodeFailure(e.to_string()).to_envelope("")),
    };

    // A gateway node forwards user calls over its own peer connection with
    // the user's session in the envelope.
    let result = match conn_session.or(env.session) {
        Some(session) => {
            registry
                .dispatch_stream(&env.service_method, env.payload, session)
                .await
        }
        None => {
            registry
                .dispatch_unary(&env.service_method, env.payload)
                .await
        }
    };

    let reply = match result {
        Ok(payload) => Envelope::reply(env.service_method, payload),
        Err(e) => {
            debug!(method = %env.service_method, error = %e, "session call failed");
            e.to_envelope(env.service_method)
        }
    };
    reply_frame(reply)
}

async fn receive_pump<R>(mut reader: R, tx: mpsc::Sender<Frame>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if !e.is_closed() {
                    warn!(error = %e, "session read failed");
                }
                break;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            if !e.is_closed() {
                warn!(error = %e, "session write failed");
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport.
//!
//! [`MemoryDialer`] maps addresses to [`RpcServer`]s living in the same
//! process. Every call or stream gets its own in-memory pipe served by
//! [`RpcServer::serve_stream`], so the full framing and multiplexing path is
//! exercised without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gamenet_protocol::{Envelope, StreamOpen};
use tokio::io::{DuplexStream, duplex, split};
use tracing::debug;

use super::{CancelHandle, Dialer, EnvelopeStream, NodeConnection, PushSink, unary_exchange};
use crate::error::{Result, RpcError};
use crate::server::RpcServer;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Dialer resolving addresses to in-process servers.
#[derive(Default)]
pub struct MemoryDialer {
    servers: Mutex<HashMap<String, Arc<RpcServer>>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable at `addr`.
    pub fn bind(&self, addr: impl Into<String>, server: Arc<RpcServer>) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.insert(addr.into(), server);
        }
    }

    /// Make `addr` unreachable and close every connection made to it.
    pub fn unbind(&self, addr: &str) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.remove(addr);
        }
        if let Ok(mut conns) = self.connections.lock() {
            conns.retain(|c| {
                if c.addr == addr {
                    c.close();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Number of successful dials so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn NodeConnection>> {
        let server = self
            .servers
            .lock()
            .ok()
            .and_then(|servers| servers.get(addr).cloned())
            .ok_or_else(|| RpcError::TransportFailure(format!("nothing listening on {addr}")))?;

        let conn = Arc::new(MemoryConnection {
            addr: addr.to_string(),
            server,
            closed: AtomicBool::new(false),
        });
        if let Ok(mut conns) = self.connections.lock() {
            conns.push(conn.clone());
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        debug!(addr, "memory connection established");
        Ok(conn)
    }
}

/// Connection to an in-process server.
pub struct MemoryConnection {
    addr: String,
    server: Arc<RpcServer>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn pipe(&self) -> Result<DuplexStream> {
        if self.is_closed() {
            return Err(RpcError::StreamClosed);
        }
        let (client, remote) = duplex(PIPE_CAPACITY);
        let server = self.server.clone();
        tokio::spawn(async move {
            let (r, w) = split(remote);
            server.serve_stream(r, w).await;
        });
        Ok(client)
    }
}

#[async_trait]
impl NodeConnection for MemoryConnection {
    async fn call(&self, request: Envelope) -> Result<Envelope> {
        let (r, w) = split(self.pipe()?);
        unary_exchange(r, w, &request).await
    }

    async fn open_stream(
        &self,
        open: StreamOpen,
        pushes: Option<PushSink>,
    ) -> Result<(EnvelopeStream, CancelHandle)> {
        let (r, w) = split(self.pipe()?);
        EnvelopeStream::open(r, w, &open, pushes).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

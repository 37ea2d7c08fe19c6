// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster client: calls methods on other nodes by logical name.
//!
//! The client keeps one connection per node and, for [`stream_call`], one
//! cached session stream per node. Node addresses come from discovery
//! subscriptions when present, else from the static cluster map. A cached
//! connection or stream whose address left the node's current address set
//! is dropped on next use and the node is dialed again.
//!
//! [`stream_call`]: ClusterClient::stream_call

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use gamenet_protocol::{Envelope, META_NAME, Session, StreamOpen};
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::discovery::AddressSet;
use crate::error::{Result, RpcError, into_result};
use crate::service_conf::{ServiceConf, ServiceTable};
use crate::transport::{
    CancelHandle, Dialer, EnvelopeStream, NodeConnection, PushSink, PushedEnvelope,
};

/// Default unary call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const PUSH_CHANNEL_CAPACITY: usize = 1024;

struct CachedStream {
    addr: String,
    stream: EnvelopeStream,
    cancel: CancelHandle,
}

impl CachedStream {
    async fn teardown(mut self) {
        self.stream.close().await;
        self.cancel.cancel();
    }
}

type StreamSlot = Arc<AsyncMutex<Option<CachedStream>>>;

#[derive(Clone)]
struct CachedConnection {
    addr: String,
    conn: Arc<dyn NodeConnection>,
}

/// Client side of the cluster RPC layer.
pub struct ClusterClient {
    node_name: String,
    dialer: Arc<dyn Dialer>,
    cluster: ArcSwap<HashMap<String, String>>,
    resolvers: ArcSwap<HashMap<String, watch::Receiver<AddressSet>>>,
    next_addr: AtomicUsize,
    connections: ArcSwap<HashMap<String, CachedConnection>>,
    dial_lock: AsyncMutex<()>,
    streams: Mutex<HashMap<String, StreamSlot>>,
    services: ServiceTable,
    pushes: broadcast::Sender<PushedEnvelope>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("node_name", &self.node_name)
            .field("cluster", &**self.cluster.load())
            .field("connections", &self.connections.load().len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ClusterClient {
    /// Create a client for the local node `node_name`.
    pub fn new(node_name: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            node_name: node_name.into(),
            dialer,
            cluster: ArcSwap::from_pointee(HashMap::new()),
            resolvers: ArcSwap::from_pointee(HashMap::new()),
            next_addr: AtomicUsize::new(0),
            connections: ArcSwap::from_pointee(HashMap::new()),
            dial_lock: AsyncMutex::new(()),
            streams: Mutex::new(HashMap::new()),
            services: ServiceTable::default(),
            pushes,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Static `node -> address` map.
    pub fn with_cluster(self, cluster: HashMap<String, String>) -> Self {
        self.cluster.store(Arc::new(cluster));
        self
    }

    pub fn with_service_conf(self, entries: Vec<ServiceConf>) -> Self {
        self.services.reload(entries);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Route `node` through a discovery subscription. Takes precedence over
    /// the static cluster map while it holds at least one address.
    pub fn attach_resolver(&self, node: &str, updates: watch::Receiver<AddressSet>) {
        self.resolvers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(node.to_string(), updates.clone());
            next
        });
        debug!(node, "resolver attached");
    }

    fn resolve(&self, node: &str) -> Result<String> {
        if let Some(rx) = self.resolvers.load().get(node) {
            let set = rx.borrow();
            if !set.is_empty() {
                let idx = self.next_addr.fetch_add(1, Ordering::Relaxed);
                if let Some(addr) = set.pick(idx) {
                    return Ok(addr.to_string());
                }
            }
        }
        self.cluster
            .load()
            .get(node)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("node '{node}'")))
    }

    /// Whether `addr` is still a current address of `node`: a member of the
    /// resolver set when that is non-empty, else the static map entry.
    fn routes_to(&self, node: &str, addr: &str) -> bool {
        if let Some(rx) = self.resolvers.load().get(node) {
            let set = rx.borrow();
            if !set.is_empty() {
                return set.contains(addr);
            }
        }
        self.cluster.load().get(node).is_some_and(|a| a == addr)
    }

    /// Get the cached connection to `node`, dialing on a miss, when the
    /// cached one has closed, or when its address is no longer current.
    pub async fn dial(&self, node: &str) -> Result<Arc<dyn NodeConnection>> {
        Ok(self.dial_entry(node).await?.conn)
    }

    async fn dial_entry(&self, node: &str) -> Result<CachedConnection> {
        if let Some(entry) = self.cached_connection(node) {
            return Ok(entry);
        }

        let _guard = self.dial_lock.lock().await;
        if let Some(entry) = self.cached_connection(node) {
            return Ok(entry);
        }
        self.evict_connection(node);

        let addr = self.resolve(node)?;
        info!(node, %addr, "dialing node");
        let conn = self.dialer.dial(&addr).await?;
        let entry = CachedConnection { addr, conn };
        self.connections.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(node.to_string(), entry.clone());
            next
        });
        Ok(entry)
    }

    fn cached_connection(&self, node: &str) -> Option<CachedConnection> {
        self.connections
            .load()
            .get(node)
            .filter(|entry| !entry.conn.is_closed() && self.routes_to(node, &entry.addr))
            .cloned()
    }

    /// Drop and close the cached connection to `node`, if any.
    fn evict_connection(&self, node: &str) {
        let previous = self.connections.load().get(node).cloned();
        let Some(previous) = previous else {
            return;
        };
        self.connections.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(node);
            next
        });
        if !previous.conn.is_closed() {
            info!(node, addr = %previous.addr, "address left the set, closing connection");
            previous.conn.close();
        }
    }

    /// One unary round trip to `node`, bounded by the call timeout.
    #[instrument(skip(self, payload, session), fields(local = %self.node_name))]
    pub async fn call(
        &self,
        node: &str,
        service_method: &str,
        payload: Vec<u8>,
        session: Option<Session>,
    ) -> Result<Vec<u8>> {
        let request = Envelope::request(service_method, payload, session);
        let exchange = async {
            let conn = self.dial(node).await?;
            conn.call(request).await
        };
        let reply = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout(self.call_timeout.as_millis() as u64))??;
        into_result(reply)
    }

    /// Open a new session stream to `node` with the given metadata.
    pub async fn stream(
        &self,
        node: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(EnvelopeStream, CancelHandle)> {
        let entry = self.dial_entry(node).await?;
        self.open_on(node, &entry, metadata).await
    }

    async fn open_on(
        &self,
        node: &str,
        entry: &CachedConnection,
        metadata: HashMap<String, String>,
    ) -> Result<(EnvelopeStream, CancelHandle)> {
        let sink = PushSink::new(node, self.pushes.clone());
        entry
            .conn
            .open_stream(StreamOpen::new(metadata), Some(sink))
            .await
    }

    async fn open_cached(&self, node: &str) -> Result<CachedStream> {
        let entry = self.dial_entry(node).await?;
        let mut metadata = HashMap::new();
        metadata.insert(META_NAME.to_string(), self.node_name.clone());
        let (stream, cancel) = self.open_on(node, &entry, metadata).await?;
        debug!(node, addr = %entry.addr, "session stream opened");
        Ok(CachedStream {
            addr: entry.addr,
            stream,
            cancel,
        })
    }

    fn stream_slot(&self, node: &str) -> Result<StreamSlot> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| RpcError::TransportFailure("stream cache lock poisoned".to_string()))?;
        Ok(streams.entry(node.to_string()).or_default().clone())
    }

    /// Call `service_method` on `node` over the cached session stream.
    ///
    /// Calls to the same node are serialized so each reply is matched to its
    /// request. A send that finds the stream closed reconnects once and
    /// resends; a second closure is a [`RpcError::TransportFailure`].
    #[instrument(skip(self, payload, session), fields(local = %self.node_name))]
    pub async fn stream_call(
        &self,
        node: &str,
        service_method: &str,
        payload: Vec<u8>,
        session: Option<Session>,
    ) -> Result<Vec<u8>> {
        let slot = self.stream_slot(node)?;
        let mut guard = slot.lock().await;
        let request = Envelope::request(service_method, payload, session);

        let mut cached = match guard.take() {
            Some(cached) if self.routes_to(node, &cached.addr) => cached,
            Some(stale) => {
                info!(node, addr = %stale.addr, "address left the set, reopening stream");
                stale.teardown().await;
                self.open_cached(node).await?
            }
            None => self.open_cached(node).await?,
        };

        match cached.stream.send(&request).await {
            Ok(()) => {}
            Err(RpcError::StreamClosed) => {
                warn!(node, "cached stream closed, reconnecting");
                cached.teardown().await;
                cached = self.open_cached(node).await?;
                match cached.stream.send(&request).await {
                    Ok(()) => {}
                    Err(RpcError::StreamClosed) => {
                        cached.teardown().await;
                        return Err(RpcError::TransportFailure(format!(
                            "stream to '{node}' closed again after reconnect"
                        )));
                    }
                    Err(e) => {
                        *guard = Some(cached);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                *guard = Some(cached);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.call_timeout, cached.stream.recv()).await {
            Ok(Ok(reply)) => {
                *guard = Some(cached);
                into_result(reply)
            }
            Ok(Err(e)) => {
                cached.cancel.cancel();
                Err(e)
            }
            Err(_) => {
                // A late reply would be matched to the next request
                cached.cancel.cancel();
                Err(RpcError::Timeout(self.call_timeout.as_millis() as u64))
            }
        }
    }

    /// Subscribe to `Push` frames arriving on cached streams.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushedEnvelope> {
        self.pushes.subscribe()
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    /// `protocol -> (node, service_method)`
    pub fn get_node_by_protocol(&self, protocol: u16) -> Result<(String, String)> {
        self.services.get_node_by_protocol(protocol)
    }

    /// `service_method -> (node, protocol)`
    pub fn get_protocol_by_service(&self, service_method: &str) -> Result<(String, u16)> {
        self.services.get_protocol_by_service(service_method)
    }

    pub fn reload_service_conf(&self, entries: Vec<ServiceConf>) {
        self.services.reload(entries);
    }

    /// Cancel every cached stream and close every cached connection.
    pub async fn close(&self) {
        let slots: Vec<StreamSlot> = self
            .streams
            .lock()
            .map(|mut streams| streams.drain().map(|(_, slot)| slot).collect())
            .unwrap_or_default();
        for slot in slots {
            if let Some(cached) = slot.lock().await.take() {
                cached.teardown().await;
            }
        }

        let conns = self.connections.swap(Arc::new(HashMap::new()));
        for entry in conns.values() {
            entry.conn.close();
        }
        info!(connections = conns.len(), "cluster client closed");
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable node runtime.
//!
//! [`NodeRuntime`] binds the QUIC server for a [`Registry`], builds the
//! node's [`ClusterClient`] from the static cluster map and service table,
//! optionally advertises the node in discovery, and tears all of it down
//! again on shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gamenet_core::registry::Registry;
//! use gamenet_core::runtime::NodeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(Registry::default());
//!
//!     let runtime = NodeRuntime::builder()
//!         .node_name("battle1")
//!         .registry(registry)
//!         .bind_addr("0.0.0.0:7100".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve until asked to stop ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gamenet_protocol::{GamenetServer, GamenetServerConfig, ServerError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{ClusterClient, DEFAULT_CALL_TIMEOUT};
use crate::discovery::{Coordinator, DEFAULT_ROOT, Registrar, Resolver};
use crate::registry::Registry;
use crate::server::{DEFAULT_STREAM_QUEUE, RpcServer};
use crate::service_conf::ServiceConf;
use crate::transport::{Dialer, QuicDialer};

/// Builder for creating a [`NodeRuntime`].
pub struct NodeRuntimeBuilder {
    node_name: Option<String>,
    registry: Option<Arc<Registry>>,
    bind_addr: SocketAddr,
    advertise_addr: Option<String>,
    coordinator: Option<Arc<dyn Coordinator>>,
    discovery_root: String,
    server_config: GamenetServerConfig,
    stream_queue: usize,
    cluster: HashMap<String, String>,
    service_conf: Vec<ServiceConf>,
    call_timeout: Duration,
    dialer: Option<Arc<dyn Dialer>>,
}

impl std::fmt::Debug for NodeRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeBuilder")
            .field("node_name", &self.node_name)
            .field("registry", &self.registry.as_ref().map(|_| "..."))
            .field("bind_addr", &self.bind_addr)
            .field("advertise_addr", &self.advertise_addr)
            .field("coordinator", &self.coordinator.as_ref().map(|_| "..."))
            .field("discovery_root", &self.discovery_root)
            .field("cluster", &self.cluster)
            .field("service_conf", &self.service_conf.len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Default for NodeRuntimeBuilder {
    fn default() -> Self {
        Self {
            node_name: None,
            registry: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7100)),
            advertise_addr: None,
            coordinator: None,
            discovery_root: DEFAULT_ROOT.to_string(),
            server_config: GamenetServerConfig::default(),
            stream_queue: DEFAULT_STREAM_QUEUE,
            cluster: HashMap::new(),
            service_conf: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            dialer: None,
        }
    }
}

impl NodeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set this node's logical name (required).
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Set the service registry to serve (required).
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the bind address for the QUIC server.
    ///
    /// Default: `0.0.0.0:7100`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Address registered in discovery. Defaults to the bound address.
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    /// Advertise the node through `coordinator` while running.
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn discovery_root(mut self, root: impl Into<String>) -> Self {
        self.discovery_root = root.into();
        self
    }

    /// QUIC transport tuning.
    pub fn server_config(mut self, config: GamenetServerConfig) -> Self {
        self.server_config = config;
        self
    }

    pub fn stream_queue(mut self, depth: usize) -> Self {
        self.stream_queue = depth;
        self
    }

    /// Static `node -> address` map for the node's client.
    pub fn cluster(mut self, cluster: HashMap<String, String>) -> Self {
        self.cluster = cluster;
        self
    }

    /// Initial service table for the node's client.
    pub fn service_conf(mut self, entries: Vec<ServiceConf>) -> Self {
        self.service_conf = entries;
        self
    }

    /// Unary and stream call timeout of the node's client.
    ///
    /// Default: 5s
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Transport the node's client dials with. Defaults to QUIC.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let node_name = self
            .node_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("node_name is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        Ok(NodeRuntimeConfig {
            node_name,
            registry,
            bind_addr: self.bind_addr,
            advertise_addr: self.advertise_addr,
            coordinator: self.coordinator,
            discovery_root: self.discovery_root,
            server_config: self.server_config,
            stream_queue: self.stream_queue,
            cluster: self.cluster,
            service_conf: self.service_conf,
            call_timeout: self.call_timeout,
            dialer: self.dialer,
        })
    }
}

/// Configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    node_name: String,
    registry: Arc<Registry>,
    bind_addr: SocketAddr,
    advertise_addr: Option<String>,
    coordinator: Option<Arc<dyn Coordinator>>,
    discovery_root: String,
    server_config: GamenetServerConfig,
    stream_queue: usize,
    cluster: HashMap<String, String>,
    service_conf: Vec<ServiceConf>,
    call_timeout: Duration,
    dialer: Option<Arc<dyn Dialer>>,
}

impl std::fmt::Debug for NodeRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeConfig")
            .field("node_name", &self.node_name)
            .field("registry", &"...")
            .field("bind_addr", &self.bind_addr)
            .field("advertise_addr", &self.advertise_addr)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl NodeRuntimeConfig {
    /// Bind the QUIC server, spawn its task, build the cluster client and
    /// register in discovery.
    ///
    /// A failed discovery registration is logged; the node still serves.
    pub async fn start(self) -> Result<NodeRuntime> {
        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(QuicDialer::localhost()?),
        };
        let client = Arc::new(
            ClusterClient::new(self.node_name.clone(), dialer)
                .with_cluster(self.cluster)
                .with_service_conf(self.service_conf)
                .with_call_timeout(self.call_timeout),
        );

        let server = GamenetServer::localhost_with_config(self.bind_addr, self.server_config)?;
        let local_addr = server.local_addr()?;

        let rpc = Arc::new(
            RpcServer::new(self.node_name.clone(), self.registry)
                .with_queue_depth(self.stream_queue),
        );
        let server_handle = tokio::spawn(rpc.clone().serve(server));

        let advertise_addr = self
            .advertise_addr
            .unwrap_or_else(|| local_addr.to_string());

        let registrar = match &self.coordinator {
            Some(coordinator) => {
                let registrar =
                    Registrar::with_root(coordinator.clone(), self.discovery_root.clone());
                if let Err(e) = registrar.register(&self.node_name, &advertise_addr).await {
                    warn!(error = %e, "discovery registration failed");
                }
                Some(registrar)
            }
            None => None,
        };

        info!(node = %self.node_name, addr = %local_addr, "NodeRuntime started");

        let resolver = self
            .coordinator
            .map(|coordinator| Resolver::with_root(coordinator, self.discovery_root));

        Ok(NodeRuntime {
            server_handle,
            rpc,
            client,
            registrar,
            resolver,
            local_addr,
            advertise_addr,
        })
    }
}

/// A running node that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    server_handle: JoinHandle<std::result::Result<(), ServerError>>,
    rpc: Arc<RpcServer>,
    client: Arc<ClusterClient>,
    registrar: Option<Registrar>,
    resolver: Option<Resolver>,
    local_addr: SocketAddr,
    advertise_addr: String,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    /// Address the QUIC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    /// The RPC server, for pushing to connected peers.
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.rpc
    }

    /// Client for calling other nodes of the cluster.
    pub fn client(&self) -> &Arc<ClusterClient> {
        &self.client
    }

    /// Route client calls to `service` through its discovery address set.
    ///
    /// Returns `false` when the runtime has no coordinator.
    pub async fn follow(&self, service: &str) -> bool {
        let Some(resolver) = &self.resolver else {
            return false;
        };
        let (initial, updates) = resolver.watch(service).await;
        info!(service, addresses = initial.len(), "following service in discovery");
        self.client.attach_resolver(service, updates);
        true
    }

    /// Unregister from discovery, close the client, then stop the server
    /// and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        info!("NodeRuntime shutting down...");

        if let Some(registrar) = &self.registrar {
            registrar.unregister().await;
        }
        self.client.close().await;
        self.rpc.shutdown();

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("NodeRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("NodeRuntime server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("NodeRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gamenet node
//!
//! Standalone node serving the built-in `Health` service. Real deployments
//! embed [`gamenet_core::runtime::NodeRuntime`] with their own services; this
//! binary is useful for smoke-testing a cluster's network and configuration.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use gamenet_core::config::Config;
use gamenet_core::discovery::Coordinator;
#[cfg(feature = "zookeeper")]
use gamenet_core::discovery::ZooKeeperCoordinator;
use gamenet_core::health::Health;
use gamenet_core::registry::Registry;
use gamenet_core::runtime::NodeRuntime;
use gamenet_core::service_conf::ServiceTable;
use gamenet_protocol::GamenetServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gamenet_core=info".parse()?),
        )
        .init();

    info!("Starting gamenet node");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        node = %config.node_name,
        bind_addr = %config.bind_addr,
        advertise_addr = %config.advertise_addr,
        codec = %config.codec,
        cluster = config.cluster.len(),
        coordinator = config.coordinator.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    let service_conf = match &config.services_file {
        Some(path) => {
            let entries = ServiceTable::load_file(path)?;
            info!(path = %path.display(), entries = entries.len(), "Service table loaded");
            entries
        }
        None => Vec::new(),
    };

    let registry = Arc::new(Registry::new(config.codec));
    Health::new(config.node_name.clone(), &registry).register()?;

    let mut builder = NodeRuntime::builder()
        .node_name(config.node_name.clone())
        .registry(registry)
        .bind_addr(config.bind_addr)
        .advertise_addr(config.advertise_addr.clone())
        .discovery_root(config.discovery_root.clone())
        .server_config(GamenetServerConfig::from_env())
        .stream_queue(config.stream_queue)
        .cluster(config.cluster.clone())
        .service_conf(service_conf.clone())
        .call_timeout(config.call_timeout);

    if let Some(ensemble) = &config.coordinator {
        builder = builder.coordinator(connect_coordinator(ensemble).await?);
    }

    let runtime = builder.build()?.start().await?;

    // Nodes named by the service table but absent from the static map are
    // looked up in discovery
    let mut followed = HashSet::new();
    for entry in &service_conf {
        if !config.cluster.contains_key(&entry.node) && followed.insert(entry.node.clone()) {
            runtime.follow(&entry.node).await;
        }
    }

    info!(addr = %runtime.local_addr(), "gamenet node ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

#[cfg(feature = "zookeeper")]
async fn connect_coordinator(ensemble: &str) -> Result<Arc<dyn Coordinator>> {
    let coordinator = ZooKeeperCoordinator::connect(ensemble).await?;
    Ok(Arc::new(coordinator))
}

#[cfg(not(feature = "zookeeper"))]
async fn connect_coordinator(ensemble: &str) -> Result<Arc<dyn Coordinator>> {
    anyhow::bail!("GAMENET_COORDINATOR={ensemble} needs the `zookeeper` feature")
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service discovery over a hierarchical coordination service.
//!
//! Nodes advertise themselves as plain leaves under
//! `/<root>/<service>/<address>`. The [`Registrar`] creates and removes those
//! leaves, and the [`Resolver`] watches a service's children and publishes
//! the live [`AddressSet`] to the cluster client.
//!
//! The coordination service itself sits behind the [`Coordinator`] trait.
//! `ZooKeeperCoordinator` (feature `zookeeper`) talks to a real ensemble so
//! nodes in different processes find each other. [`MemoryCoordinator`] is an
//! in-process implementation for single-host clusters and tests.

pub mod memory;
pub mod registrar;
pub mod resolver;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use memory::MemoryCoordinator;
pub use registrar::Registrar;
pub use resolver::Resolver;
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperCoordinator;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

/// Default namespace root.
pub const DEFAULT_ROOT: &str = "gamenet";

/// Errors from the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("coordination service unavailable: {0}")]
    ConnectionLoss(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Fires once when the children of the watched node change.
pub type ChildWatch = oneshot::Receiver<()>;

/// Minimal tree-store operations needed for discovery.
///
/// Paths are absolute and `/`-separated. Creating a node requires its parent
/// to exist.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn create(&self, path: &str) -> Result<(), CoordinatorError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordinatorError>;

    /// Delete a node without children.
    async fn delete(&self, path: &str) -> Result<(), CoordinatorError>;

    /// Child names of `path`, in no particular order.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinatorError>;

    /// Child names plus a one-shot watch on the next change.
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), CoordinatorError>;
}

/// `/<root>/<service>`
pub fn service_path(root: &str, service: &str) -> String {
    format!("/{}/{}", root.trim_matches('/'), service)
}

/// The reachable addresses of one logical service.
///
/// Sorted and deduplicated, so two sets with the same members compare equal
/// regardless of the order the coordinator returned them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addrs: Vec<String>,
}

impl AddressSet {
    pub fn new(mut addrs: Vec<String>) -> Self {
        addrs.sort();
        addrs.dedup();
        Self { addrs }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.binary_search_by(|a| a.as_str().cmp(addr)).is_ok()
    }

    /// Round-robin pick.
    pub fn pick(&self, idx: usize) -> Option<&str> {
        if self.addrs.is_empty() {
            return None;
        }
        Some(&self.addrs[idx % self.addrs.len()])
    }

    pub fn as_slice(&self) -> &[String] {
        &self.addrs
    }
}

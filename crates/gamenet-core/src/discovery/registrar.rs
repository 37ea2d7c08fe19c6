// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advertises this node's services in the coordination tree.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::{Coordinator, CoordinatorError, DEFAULT_ROOT, service_path};

/// Creates `/<root>/<service>/<address>` leaves and removes them again.
pub struct Registrar {
    coordinator: Arc<dyn Coordinator>,
    root: String,
    registered: Mutex<Vec<String>>,
}

impl Registrar {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self::with_root(coordinator, DEFAULT_ROOT)
    }

    pub fn with_root(coordinator: Arc<dyn Coordinator>, root: impl Into<String>) -> Self {
        Self {
            coordinator,
            root: root.into(),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Advertise `address` under `service`.
    ///
    /// Missing parents are created on first use and an existing leaf counts
    /// as success, so registering twice is harmless.
    pub async fn register(&self, service: &str, address: &str) -> Result<(), CoordinatorError> {
        let parent = service_path(&self.root, service);
        let root = format!("/{}", self.root.trim_matches('/'));
        self.ensure(&root).await?;
        self.ensure(&parent).await?;

        let leaf = format!("{parent}/{address}");
        self.ensure(&leaf).await?;

        if let Ok(mut registered) = self.registered.lock()
            && !registered.contains(&leaf)
        {
            registered.push(leaf.clone());
        }
        info!(path = %leaf, "registered in discovery");
        Ok(())
    }

    async fn ensure(&self, path: &str) -> Result<(), CoordinatorError> {
        match self.coordinator.create(path).await {
            Ok(()) | Err(CoordinatorError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Paths created by [`register`](Self::register) and not yet removed.
    pub fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Remove every registered leaf. Failures are logged and skipped.
    pub async fn unregister(&self) {
        let paths: Vec<String> = self
            .registered
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default();

        for path in paths.iter().rev() {
            match self.coordinator.delete(path).await {
                Ok(()) | Err(CoordinatorError::NoNode(_)) => {
                    info!(path = %path, "unregistered from discovery");
                }
                Err(e) => warn!(path = %path, error = %e, "failed to unregister"),
            }
        }
    }
}

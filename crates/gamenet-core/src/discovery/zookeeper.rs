// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator backed by a ZooKeeper ensemble.
//!
//! Nodes are created persistent with an open ACL and no data, so leaves
//! left behind by a crashed node stay until something deletes them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};
use zookeeper_client as zk;

use super::{ChildWatch, Coordinator, CoordinatorError};

/// How long [`ZooKeeperCoordinator::connect`] waits for a session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Coordinator`] talking to ZooKeeper.
#[derive(Clone)]
pub struct ZooKeeperCoordinator {
    client: zk::Client,
}

impl std::fmt::Debug for ZooKeeperCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZooKeeperCoordinator").finish_non_exhaustive()
    }
}

impl ZooKeeperCoordinator {
    /// Connect to `ensemble`, a comma-separated `host:port` list.
    #[instrument]
    pub async fn connect(ensemble: &str) -> Result<Self, CoordinatorError> {
        let client = tokio::time::timeout(CONNECT_TIMEOUT, zk::Client::connect(ensemble))
            .await
            .map_err(|_| {
                CoordinatorError::ConnectionLoss(format!(
                    "no session with {ensemble} after {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| CoordinatorError::ConnectionLoss(format!("{ensemble}: {e}")))?;
        info!(ensemble, "connected to zookeeper");
        Ok(Self { client })
    }
}

fn map_error(path: &str, err: zk::Error) -> CoordinatorError {
    match err {
        zk::Error::NodeExists => CoordinatorError::NodeExists(path.to_string()),
        zk::Error::NoNode => CoordinatorError::NoNode(path.to_string()),
        zk::Error::NotEmpty => CoordinatorError::NotEmpty(path.to_string()),
        zk::Error::BadArguments(reason) => {
            CoordinatorError::InvalidPath(format!("{path}: {reason}"))
        }
        other => CoordinatorError::ConnectionLoss(format!("{path}: {other}")),
    }
}

#[async_trait]
impl Coordinator for ZooKeeperCoordinator {
    async fn create(&self, path: &str) -> Result<(), CoordinatorError> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        self.client
            .create(path, &[], &options)
            .await
            .map(|_| ())
            .map_err(|e| map_error(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinatorError> {
        self.client
            .check_stat(path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|e| map_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinatorError> {
        self.client
            .delete(path, None)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinatorError> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), CoordinatorError> {
        let (children, watcher) = self
            .client
            .list_and_watch_children(path)
            .await
            .map_err(|e| map_error(path, e))?;

        // Session loss also ends the watcher, which makes the resolver re-read
        let (tx, rx) = oneshot::channel();
        let watched = path.to_string();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            debug!(path = %watched, ?event, "zookeeper watch fired");
            let _ = tx.send(());
        });
        Ok((children, rx))
    }
}

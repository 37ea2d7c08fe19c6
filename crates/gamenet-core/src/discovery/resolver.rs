// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watches a service's children and publishes its live address set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{AddressSet, Coordinator, DEFAULT_ROOT, service_path};

/// Delay before re-establishing a failed watch.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Turns coordination-tree children into [`AddressSet`] updates.
#[derive(Clone)]
pub struct Resolver {
    coordinator: Arc<dyn Coordinator>,
    root: String,
    retry_delay: Duration,
}

impl Resolver {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self::with_root(coordinator, DEFAULT_ROOT)
    }

    pub fn with_root(coordinator: Arc<dyn Coordinator>, root: impl Into<String>) -> Self {
        Self {
            coordinator,
            root: root.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Current addresses of `service` plus a feed of later sets.
    ///
    /// A background task keeps the feed current for as long as at least one
    /// receiver exists. The feed only carries whole sets and may skip
    /// intermediate ones. If the service is not reachable yet, the initial
    /// set is empty and the task keeps retrying.
    pub async fn watch(&self, service: &str) -> (AddressSet, watch::Receiver<AddressSet>) {
        let path = service_path(&self.root, service);
        let initial = match self.coordinator.children(&path).await {
            Ok(children) => AddressSet::new(children),
            Err(e) => {
                debug!(path = %path, error = %e, "no initial addresses");
                AddressSet::default()
            }
        };

        let (tx, rx) = watch::channel(initial.clone());
        tokio::spawn(watch_loop(
            self.coordinator.clone(),
            path,
            tx,
            self.retry_delay,
        ));
        (initial, rx)
    }
}

async fn watch_loop(
    coordinator: Arc<dyn Coordinator>,
    path: String,
    tx: watch::Sender<AddressSet>,
    retry_delay: Duration,
) {
    loop {
        match coordinator.watch_children(&path).await {
            Ok((children, fired)) => {
                let next = AddressSet::new(children);
                let changed = tx.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    *current = next.clone();
                    true
                });
                if changed {
                    info!(path = %path, addresses = ?next.as_slice(), "address set updated");
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = fired => {}
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "watch failed, retrying");
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    debug!(path = %path, "no subscribers left, watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{MemoryCoordinator, Registrar};

    async fn wait_for(rx: &mut watch::Receiver<AddressSet>, want: &[&str]) {
        let want = AddressSet::new(want.iter().map(|s| s.to_string()).collect());
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|set| *set == want))
            .await
            .expect("address set never converged")
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_set() {
        let coord = Arc::new(MemoryCoordinator::new());
        let registrar = Registrar::new(coord.clone());
        registrar.register("battle", "b:1").await.unwrap();
        registrar.register("battle", "a:1").await.unwrap();

        let (initial, _rx) = Resolver::new(coord).watch("battle").await;
        assert_eq!(initial.as_slice(), ["a:1".to_string(), "b:1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_service_resolves_once_registered() {
        let coord = Arc::new(MemoryCoordinator::new());
        let resolver = Resolver::new(coord.clone()).with_retry_delay(Duration::from_millis(10));

        let (initial, mut rx) = resolver.watch("lobby").await;
        assert!(initial.is_empty());

        Registrar::new(coord).register("lobby", "c:1").await.unwrap();
        wait_for(&mut rx, &["c:1"]).await;
    }

    #[tokio::test]
    async fn test_recovers_after_connection_loss() {
        let coord = Arc::new(MemoryCoordinator::new());
        let registrar = Registrar::new(coord.clone());
        registrar.register("battle", "a:1").await.unwrap();

        let resolver = Resolver::new(coord.clone()).with_retry_delay(Duration::from_millis(10));
        let (_, mut rx) = resolver.watch("battle").await;

        coord.set_available(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        coord.set_available(true);

        registrar.register("battle", "b:1").await.unwrap();
        wait_for(&mut rx, &["a:1", "b:1"]).await;
    }
}

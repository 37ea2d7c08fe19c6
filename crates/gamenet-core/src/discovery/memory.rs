// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process coordinator with tree and child-watch semantics.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use super::{ChildWatch, Coordinator, CoordinatorError};

#[derive(Default)]
struct Tree {
    nodes: BTreeSet<String>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    unavailable: bool,
}

impl Tree {
    fn check(&self, path: &str) -> Result<(), CoordinatorError> {
        if self.unavailable {
            return Err(CoordinatorError::ConnectionLoss(path.to_string()));
        }
        if path == "/" {
            return Ok(());
        }
        if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
            return Err(CoordinatorError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|p| p.starts_with(&prefix))
            .filter_map(|p| {
                let rest = &p[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, parent: &str) {
        if let Some(watchers) = self.watches.remove(parent) {
            debug!(path = parent, watchers = watchers.len(), "children changed");
            for w in watchers {
                let _ = w.send(());
            }
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Coordinator keeping its tree in memory.
#[derive(Default)]
pub struct MemoryCoordinator {
    tree: Mutex<Tree>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the coordination service. Going
    /// unavailable fires every pending watch, like a session disconnect.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut tree) = self.tree.lock() {
            tree.unavailable = !available;
            if !available {
                let parents: Vec<String> = tree.watches.keys().cloned().collect();
                for p in parents {
                    tree.fire(&p);
                }
            }
        }
    }

    fn with_tree<T>(
        &self,
        path: &str,
        f: impl FnOnce(&mut Tree) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        let mut tree = self
            .tree
            .lock()
            .map_err(|_| CoordinatorError::ConnectionLoss("tree lock poisoned".to_string()))?;
        tree.check(path)?;
        f(&mut *tree)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str) -> Result<(), CoordinatorError> {
        self.with_tree(path, |tree| {
            if tree.exists(path) {
                return Err(CoordinatorError::NodeExists(path.to_string()));
            }
            let parent = parent_of(path);
            if !tree.exists(parent) {
                return Err(CoordinatorError::NoNode(parent.to_string()));
            }
            tree.nodes.insert(path.to_string());
            tree.fire(parent);
            Ok(())
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinatorError> {
        self.with_tree(path, |tree| Ok(tree.exists(path)))
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinatorError> {
        self.with_tree(path, |tree| {
            if !tree.nodes.contains(path) {
                return Err(CoordinatorError::NoNode(path.to_string()));
            }
            if !tree.children(path).is_empty() {
                return Err(CoordinatorError::NotEmpty(path.to_string()));
            }
            tree.nodes.remove(path);
            tree.fire(parent_of(path));
            Ok(())
        })
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinatorError> {
        self.with_tree(path, |tree| {
            if !tree.exists(path) {
                return Err(CoordinatorError::NoNode(path.to_string()));
            }
            Ok(tree.children(path))
        })
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, ChildWatch), CoordinatorError> {
        self.with_tree(path, |tree| {
            if !tree.exists(path) {
                return Err(CoordinatorError::NoNode(path.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            tree.watches.entry(path.to_string()).or_default().push(tx);
            Ok((tree.children(path), rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let coord = MemoryCoordinator::new();
        assert_eq!(
            coord.create("/gamenet/battle").await,
            Err(CoordinatorError::NoNode("/gamenet".into()))
        );
        coord.create("/gamenet").await.unwrap();
        coord.create("/gamenet/battle").await.unwrap();
        assert_eq!(
            coord.create("/gamenet/battle").await,
            Err(CoordinatorError::NodeExists("/gamenet/battle".into()))
        );
        assert!(coord.exists("/gamenet/battle").await.unwrap());
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let coord = MemoryCoordinator::new();
        for p in ["/g", "/g/battle", "/g/battle/10.0.0.1:7100", "/g/lobby"] {
            coord.create(p).await.unwrap();
        }
        let mut kids = coord.children("/g").await.unwrap();
        kids.sort();
        assert_eq!(kids, vec!["battle".to_string(), "lobby".to_string()]);
        assert_eq!(
            coord.children("/g/battle").await.unwrap(),
            vec!["10.0.0.1:7100".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let coord = MemoryCoordinator::new();
        coord.create("/g").await.unwrap();
        coord.create("/g/a").await.unwrap();
        assert_eq!(
            coord.delete("/g").await,
            Err(CoordinatorError::NotEmpty("/g".into()))
        );
        coord.delete("/g/a").await.unwrap();
        coord.delete("/g").await.unwrap();
        assert_eq!(
            coord.delete("/g").await,
            Err(CoordinatorError::NoNode("/g".into()))
        );
    }

    #[tokio::test]
    async fn test_watch_fires_once_on_child_change() {
        let coord = MemoryCoordinator::new();
        coord.create("/g").await.unwrap();
        let (kids, watch) = coord.watch_children("/g").await.unwrap();
        assert!(kids.is_empty());

        coord.create("/g/a").await.unwrap();
        watch.await.unwrap();

        // Grandchildren do not touch a watch on the grandparent
        let (_, mut watch) = coord.watch_children("/g").await.unwrap();
        coord.create("/g/a/x").await.unwrap();
        assert!(watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unavailable_fails_and_fires_watches() {
        let coord = MemoryCoordinator::new();
        coord.create("/g").await.unwrap();
        let (_, watch) = coord.watch_children("/g").await.unwrap();

        coord.set_available(false);
        watch.await.unwrap();
        assert!(matches!(
            coord.children("/g").await,
            Err(CoordinatorError::ConnectionLoss(_))
        ));

        coord.set_available(true);
        assert!(coord.children("/g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_paths() {
        let coord = MemoryCoordinator::new();
        for p in ["g", "/g/", "/g//a"] {
            assert!(matches!(
                coord.create(p).await,
                Err(CoordinatorError::InvalidPath(_))
            ));
        }
    }
}

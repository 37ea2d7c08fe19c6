// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol-number routing table.
//!
//! Gateway nodes receive client messages tagged with a numeric protocol id.
//! The table maps that id to the `"Service.Method"` it invokes and the node
//! hosting it, and back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, RpcError};

/// One routing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConf {
    #[serde(alias = "pnum")]
    pub protocol: u16,
    #[serde(alias = "sname")]
    pub service_method: String,
    pub node: String,
}

#[derive(Debug, Default)]
struct Index {
    by_protocol: HashMap<u16, Arc<ServiceConf>>,
    by_method: HashMap<String, Arc<ServiceConf>>,
}

impl Index {
    fn build(entries: Vec<ServiceConf>) -> Self {
        let mut index = Index::default();
        for entry in entries {
            let entry = Arc::new(entry);
            if let Some(prev) = index.by_protocol.insert(entry.protocol, entry.clone()) {
                warn!(
                    protocol = entry.protocol,
                    replaced = %prev.service_method,
                    "duplicate protocol number, last entry wins"
                );
                index.by_method.remove(&prev.service_method);
            }
            index
                .by_method
                .insert(entry.service_method.clone(), entry.clone());
        }
        index
    }
}

/// Both lookup directions, swapped together on reload.
#[derive(Debug, Default)]
pub struct ServiceTable {
    index: ArcSwap<Index>,
}

impl ServiceTable {
    pub fn new(entries: Vec<ServiceConf>) -> Self {
        Self {
            index: ArcSwap::from_pointee(Index::build(entries)),
        }
    }

    /// Load entries from a JSON array file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<ServiceConf>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| RpcError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Replace the whole table. Readers see either the old or the new table.
    pub fn reload(&self, entries: Vec<ServiceConf>) {
        let index = Index::build(entries);
        info!(entries = index.by_protocol.len(), "service table reloaded");
        self.index.store(Arc::new(index));
    }

    /// `protocol -> (node, service_method)`
    pub fn get_node_by_protocol(&self, protocol: u16) -> Result<(String, String)> {
        self.index
            .load()
            .by_protocol
            .get(&protocol)
            .map(|e| (e.node.clone(), e.service_method.clone()))
            .ok_or_else(|| RpcError::NotFound(format!("protocol {protocol}")))
    }

    /// `service_method -> (node, protocol)`
    pub fn get_protocol_by_service(&self, service_method: &str) -> Result<(String, u16)> {
        self.index
            .load()
            .by_method
            .get(service_method)
            .map(|e| (e.node.clone(), e.protocol))
            .ok_or_else(|| RpcError::NotFound(format!("service method '{service_method}'")))
    }

    pub fn len(&self) -> usize {
        self.index.load().by_protocol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

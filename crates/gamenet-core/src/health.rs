// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in `Health` service every node binary registers.

use std::sync::{Arc, Weak};

use crate::error::{Result, RpcError};
use crate::registry::{Registry, Service};

/// `Health.Ping` echoes its argument; `Health.Services` lists the node's
/// registered services.
pub struct Health {
    node: String,
    registry: Weak<Registry>,
}

impl Health {
    pub fn new(node: impl Into<String>, registry: &Arc<Registry>) -> Self {
        Self {
            node: node.into(),
            registry: Arc::downgrade(registry),
        }
    }

    /// Register the service into the registry it was created for.
    pub fn register(self) -> Result<String> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| RpcError::Config("registry dropped".to_string()))?;
        registry.register(
            Service::new(self)
                .method("Ping", |h: Arc<Health>, msg: String| async move {
                    Ok::<_, RpcError>(format!("{}: {msg}", h.node))
                })
                .method("Services", |h: Arc<Health>, _: ()| async move {
                    h.registry
                        .upgrade()
                        .map(|r| r.services())
                        .ok_or_else(|| RpcError::HandlerError("registry dropped".to_string()))
                }),
        )
    }
}

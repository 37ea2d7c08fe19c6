// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gamenet-core integration tests.
//!
//! Provides an `Echo`/`Room` registry and helpers wiring in-process nodes to
//! a cluster client through `MemoryDialer`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gamenet_core::client::ClusterClient;
use gamenet_core::registry::{Registry, Service};
use gamenet_core::server::RpcServer;
use gamenet_core::transport::memory::MemoryDialer;
use gamenet_protocol::{Codec, Session};

pub struct Echo;

pub struct Room {
    pub name: String,
}

/// Registry with:
/// - `Echo.Say(String) -> String`
/// - `Echo.Slow(u64) -> u64`, sleeping that many milliseconds first
/// - `Echo.Fail(String)`, always failing with the argument
/// - `Room.Enter`, session-aware, replying `"<room>:<user_id>:<payload>"`
pub fn echo_registry(room: &str) -> Arc<Registry> {
    let registry = Registry::new(Codec::MsgPack);
    registry
        .register(
            Service::new(Echo)
                .method("Say", |_e: Arc<Echo>, msg: String| async move {
                    Ok::<_, String>(msg)
                })
                .method("Slow", |_e: Arc<Echo>, ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, String>(ms)
                })
                .method("Fail", |_e: Arc<Echo>, msg: String| async move {
                    Err::<(), _>(msg)
                }),
        )
        .expect("register Echo");
    registry
        .register(Service::new(Room { name: room.to_string() }).session_method(
            "Enter",
            |room: Arc<Room>, session: Session, payload: Vec<u8>| async move {
                let text = String::from_utf8_lossy(&payload);
                format!("{}:{}:{}", room.name, session.user_id, text).into_bytes()
            },
        ))
        .expect("register Room");
    Arc::new(registry)
}

/// Start an in-process node named `name`, reachable at `mem:<name>`.
pub fn start_node(dialer: &MemoryDialer, name: &str) -> Arc<RpcServer> {
    let server = Arc::new(RpcServer::new(name, echo_registry(name)));
    dialer.bind(format!("mem:{name}"), server.clone());
    server
}

/// Cluster client for node `gate` knowing `nodes` at their `mem:` addresses.
pub fn client(dialer: Arc<MemoryDialer>, nodes: &[&str]) -> ClusterClient {
    let cluster: HashMap<String, String> = nodes
        .iter()
        .map(|n| (n.to_string(), format!("mem:{n}")))
        .collect();
    ClusterClient::new("gate", dialer).with_cluster(cluster)
}

pub fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    Codec::MsgPack.encode(value).expect("encode")
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
    Codec::MsgPack.decode(bytes).expect("decode")
}

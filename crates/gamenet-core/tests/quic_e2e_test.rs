// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end over real QUIC on localhost: a `NodeRuntime` serving the echo
//! registry and a `ClusterClient` dialing it with `QuicDialer`.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use gamenet_core::discovery::MemoryCoordinator;
use gamenet_core::runtime::NodeRuntime;
use gamenet_core::transport::QuicDialer;
use gamenet_core::{ClusterClient, RpcError, Session};
use gamenet_protocol::{AGENT_NAME, Envelope, META_NAME, META_UID};

async fn start_runtime(name: &str) -> NodeRuntime {
    NodeRuntime::builder()
        .node_name(name)
        .registry(echo_registry(name))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

fn quic_client(node: &str, runtime: &NodeRuntime) -> ClusterClient {
    let cluster = HashMap::from([(node.to_string(), runtime.local_addr().to_string())]);
    ClusterClient::new("gate", Arc::new(QuicDialer::localhost().unwrap())).with_cluster(cluster)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unary_over_quic() {
    let runtime = start_runtime("node1").await;
    let client = quic_client("node1", &runtime);

    let reply = client
        .call("node1", "Echo.Say", encode(&"hello"), None)
        .await
        .unwrap();
    assert_eq!(decode::<String>(&reply), "hello");

    let err = client
        .call("node1", "Echo.Unknown", encode(&"hello"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)));

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_call_and_push_over_quic() {
    let runtime = start_runtime("battle1").await;
    let client = quic_client("battle1", &runtime);
    let mut pushes = client.subscribe_pushes();

    for i in 0..5u64 {
        let reply = client
            .stream_call("battle1", "Echo.Slow", encode(&i), None)
            .await
            .unwrap();
        assert_eq!(decode::<u64>(&reply), i);
    }

    let reply = client
        .stream_call("battle1", "Room.Enter", b"go".to_vec(), Some(Session::new(3)))
        .await
        .unwrap();
    assert_eq!(reply, b"battle1:3:go".to_vec());

    let notice = Envelope::request("Battle.Over", b"gg".to_vec(), None);
    runtime.server().push("gate", notice.clone()).await.unwrap();
    let pushed = pushes.recv().await.unwrap();
    assert_eq!(pushed.envelope, notice);

    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_stream_over_quic() {
    let runtime = start_runtime("lobby1").await;
    let client = quic_client("lobby1", &runtime);

    let metadata = HashMap::from([
        (META_NAME.to_string(), AGENT_NAME.to_string()),
        (META_UID.to_string(), "77".to_string()),
    ]);
    let (mut stream, cancel) = client.stream("lobby1", metadata).await.unwrap();
    stream
        .send(&Envelope::request("Room.Enter", b"hi".to_vec(), None))
        .await
        .unwrap();
    let reply = stream.recv().await.unwrap();
    assert_eq!(reply.payload, b"lobby1:77:hi".to_vec());

    cancel.cancel();
    client.close().await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_advertises_in_discovery() {
    let coord = Arc::new(MemoryCoordinator::new());
    let runtime = NodeRuntime::builder()
        .node_name("chat1")
        .registry(echo_registry("chat1"))
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .advertise_addr("10.0.0.5:7100")
        .coordinator(coord.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let resolver = gamenet_core::discovery::Resolver::new(coord.clone());
    let (set, _rx) = resolver.watch("chat1").await;
    assert_eq!(set.as_slice(), ["10.0.0.5:7100".to_string()]);

    runtime.shutdown().await.unwrap();
    let (set, _rx) = resolver.watch("chat1").await;
    assert!(set.is_empty());
}

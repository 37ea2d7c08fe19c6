// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests over in-process nodes.
//!
//! These tests verify:
//! - Unary calls by node name, including error kinds
//! - Session streams: reply ordering, agent sessions, pushes to peers
//! - The cached stream used by `stream_call`

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use gamenet_core::RpcError;
use gamenet_core::registry::{Registry, Service};
use gamenet_core::transport::memory::MemoryDialer;
use gamenet_protocol::{AGENT_NAME, Envelope, META_NAME, META_UID, Session};

// ============================================================================
// Unary calls
// ============================================================================

#[tokio::test]
async fn test_echo_say_hello() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]);

    let reply = client
        .call("node1", "Echo.Say", encode(&"hello"), None)
        .await
        .unwrap();
    assert_eq!(decode::<String>(&reply), "hello");
}

#[tokio::test]
async fn test_echo_unknown_is_not_found() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]);

    let err = client
        .call("node1", "Echo.Unknown", encode(&"hello"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn test_handler_error_travels_in_reply() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]);

    let err = client
        .call("node1", "Echo.Fail", encode(&"out of mana"), None)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::HandlerError("out of mana".into()));

    // The connection is still usable afterwards
    let reply = client
        .call("node1", "Echo.Say", encode(&"still here"), None)
        .await
        .unwrap();
    assert_eq!(decode::<String>(&reply), "still here");
}

#[tokio::test]
async fn test_bad_argument_is_decode_failure() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]);

    let err = client
        .call("node1", "Echo.Slow", encode(&"not a number"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DecodeFailure(_)), "got {err:?}");
}

#[tokio::test]
async fn test_call_times_out() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]).with_call_timeout(Duration::from_millis(50));

    let err = client
        .call("node1", "Echo.Slow", encode(&2_000u64), None)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout(50));
}

#[tokio::test]
async fn test_connection_is_reused() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer.clone(), &["node1"]);

    for _ in 0..5 {
        client
            .call("node1", "Echo.Say", encode(&"x"), None)
            .await
            .unwrap();
    }
    assert_eq!(dialer.dial_count(), 1);

    client.close().await;
    client
        .call("node1", "Echo.Say", encode(&"x"), None)
        .await
        .unwrap();
    assert_eq!(dialer.dial_count(), 2);
}

#[tokio::test]
async fn test_unreachable_node_is_transport_failure() {
    let dialer = Arc::new(MemoryDialer::new());
    let client = client(dialer, &["node1"]);

    let err = client
        .call("node1", "Echo.Say", encode(&"x"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::TransportFailure(_)), "got {err:?}");
}

// ============================================================================
// Session streams
// ============================================================================

fn peer_metadata(name: &str) -> HashMap<String, String> {
    HashMap::from([(META_NAME.to_string(), name.to_string())])
}

/// Replies come back in request order even when earlier requests take
/// longer to handle.
#[tokio::test]
async fn test_replies_keep_request_order() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = client(dialer, &["node1"]);

    let (mut stream, _cancel) = client
        .stream("node1", peer_metadata("gate"))
        .await
        .unwrap();

    let delays: Vec<u64> = vec![40, 5, 30, 0, 20, 1, 10];
    for ms in &delays {
        stream
            .send(&Envelope::request("Echo.Slow", encode(ms), None))
            .await
            .unwrap();
    }
    for ms in &delays {
        let reply = stream.recv().await.unwrap();
        assert!(!reply.is_error());
        assert_eq!(decode::<u64>(&reply.payload), *ms);
    }
}

#[tokio::test]
async fn test_agent_session_uses_connection_user() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "lobby1");
    let client = client(dialer, &["lobby1"]);

    let metadata = HashMap::from([
        (META_NAME.to_string(), AGENT_NAME.to_string()),
        (META_UID.to_string(), "123321".to_string()),
    ]);
    let (mut stream, cancel) = client.stream("lobby1", metadata).await.unwrap();

    for text in ["first", "second"] {
        stream
            .send(&Envelope::request("Room.Enter", text.as_bytes().to_vec(), None))
            .await
            .unwrap();
        let reply = stream.recv().await.unwrap();
        assert_eq!(
            String::from_utf8(reply.payload).unwrap(),
            format!("lobby1:123321:{text}")
        );
    }

    cancel.cancel();
    assert_eq!(
        stream
            .send(&Envelope::request("Room.Enter", vec![], None))
            .await,
        Err(RpcError::StreamClosed)
    );
}

#[tokio::test]
async fn test_agent_without_uid_is_rejected() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "lobby1");
    let client = client(dialer, &["lobby1"]);

    let metadata = HashMap::from([(META_NAME.to_string(), AGENT_NAME.to_string())]);
    let (mut stream, _cancel) = client.stream("lobby1", metadata).await.unwrap();

    assert!(matches!(
        stream.recv().await,
        Err(RpcError::InvalidMetadata(_))
    ));
}

#[tokio::test]
async fn test_push_reaches_peer_subscribers() {
    let dialer = Arc::new(MemoryDialer::new());
    let battle = start_node(&dialer, "battle1");
    let client = client(dialer, &["battle1"]);
    let mut pushes = client.subscribe_pushes();

    // The first stream_call opens the cached stream announcing "gate"
    client
        .stream_call("battle1", "Echo.Say", encode(&"hi"), None)
        .await
        .unwrap();
    assert_eq!(battle.peers().names(), vec!["gate".to_string()]);

    let notice = Envelope::request("Battle.Started", b"round 1".to_vec(), None);
    battle.push("gate", notice.clone()).await.unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.node, "battle1");
    assert_eq!(pushed.envelope, notice);

    assert!(matches!(
        battle.push("nobody", notice).await,
        Err(RpcError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stream_call_reuses_one_stream() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "node1");
    let client = Arc::new(client(dialer.clone(), &["node1"]));

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client
                .stream_call("node1", "Echo.Slow", encode(&(i * 3)), None)
                .await
                .unwrap();
            assert_eq!(decode::<u64>(&reply), i * 3);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn test_stream_call_forwards_user_session() {
    let dialer = Arc::new(MemoryDialer::new());
    start_node(&dialer, "room1");
    let client = client(dialer, &["room1"]);

    let reply = client
        .stream_call("room1", "Room.Enter", b"hello".to_vec(), Some(Session::new(7)))
        .await
        .unwrap();
    assert_eq!(reply, b"room1:7:hello".to_vec());

    let err = client
        .stream_call("room1", "Room.Enter", b"hello".to_vec(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NotFound(_)));
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_duplicate_registration_leaves_table_unchanged() {
    let registry = Registry::default();
    registry
        .register(Service::new(Echo).method("Say", |_e: Arc<Echo>, m: String| async move {
            Ok::<_, String>(m)
        }))
        .unwrap();
    let before = registry.services();

    let err = registry
        .register(Service::new(Echo).method("Shout", |_e: Arc<Echo>, m: String| async move {
            Ok::<_, String>(m.to_uppercase())
        }))
        .unwrap_err();
    assert_eq!(err, RpcError::AlreadyRegistered("Echo".into()));
    assert_eq!(registry.services(), before);

    assert!(registry
        .dispatch_unary("Echo.Shout", encode(&"x"))
        .await
        .is_err());
}

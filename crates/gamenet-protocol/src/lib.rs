// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gamenet Protocol - QUIC + Protobuf wire layer for cluster RPC
//!
//! This crate carries envelopes between game-server nodes and between end
//! users and the gateway node. It knows nothing about services or routing;
//! `gamenet-core` builds the registry, stream sessions and cluster client on
//! top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    gamenet-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Streams: unary (1 request, 1 reply) + session (Open, ...)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: Protobuf (prost), payload via msgpack or JSON    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gamenet_protocol::{Envelope, GamenetClient, client::unary_call};
//!
//! let client = GamenetClient::localhost()?;
//! let conn = client.connect("127.0.0.1:7100").await?;
//!
//! let reply = unary_call(&conn, &Envelope::request("Echo.Say", payload, None)).await?;
//! ```

pub mod client;
pub mod codec;
pub mod envelope;
pub mod frame;
pub mod server;

pub use client::{ClientError, GamenetClient, GamenetClientConfig};
pub use codec::{Codec, CodecError};
pub use envelope::{AGENT_NAME, Envelope, META_NAME, META_UID, Session, StreamOpen};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{
    ConnectionHandler, GamenetServer, GamenetServerConfig, ServerError, StreamHandler,
};

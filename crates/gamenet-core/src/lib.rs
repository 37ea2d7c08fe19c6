// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gamenet core: cluster RPC for game-server nodes.
//!
//! Every node in a cluster (gateway, lobby, battle, ...) is a Rust process
//! running this crate. Nodes expose typed service methods through a
//! [`Registry`](registry::Registry), serve them over QUIC with an
//! [`RpcServer`](server::RpcServer), and call each other by logical node
//! name through a [`ClusterClient`](client::ClusterClient).
//!
//! # Architecture
//!
//! ```text
//!   end users                    gateway node                     battle node
//! ┌──────────┐  agent session ┌───────────────┐  peer session  ┌───────────────┐
//! │ player   │───────────────►│ RpcServer     │                │ RpcServer     │
//! │ uid=42   │   (name=agent) │   Registry    │                │   Registry    │
//! └──────────┘                │ ClusterClient │───────────────►│               │
//!                             │   cached      │  stream_call   │  PeerTable ───┼──► Push
//!                             │   streams     │◄───────────────┤               │
//!                             └───────┬───────┘                └───────┬───────┘
//!                                     │ watch                          │ register
//!                                     ▼                                ▼
//!                             ┌──────────────────────────────────────────────┐
//!                             │      coordinator  /gamenet/<service>/<addr>  │
//!                             └──────────────────────────────────────────────┘
//! ```
//!
//! # Calling conventions
//!
//! | Convention | Handler shape | Reached through |
//! |------------|---------------|-----------------|
//! | Positional | `Fn(Arc<S>, A) -> Result<R, E>` | unary calls, peer streams without a session |
//! | Session | `Fn(Arc<S>, Session, Vec<u8>) -> Vec<u8>` | agent streams, envelopes carrying a session |
//!
//! # Wire format
//!
//! Each frame is a `u32` length, a `u16` message type and a protobuf
//! envelope; see [`gamenet_protocol`]. Positional arguments and replies are
//! encoded with the registry's [`Codec`](gamenet_protocol::Codec).
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | service table and dispatcher |
//! | [`server`] | stream classification, unary calls, session multiplexer |
//! | [`client`] | cluster client with connection and stream cache |
//! | [`transport`] | dialer and connection seams (QUIC, in-memory) |
//! | [`discovery`] | registrar, resolver, coordinator trait |
//! | [`service_conf`] | protocol number and service-method routing table |
//! | [`runtime`] | embeddable node runtime |

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
#[cfg(feature = "http")]
pub mod gateway;
pub mod health;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod service_conf;
pub mod transport;

pub use client::ClusterClient;
pub use error::{Result, RpcError};
pub use registry::{CallingConvention, Registry, Service};
pub use runtime::NodeRuntime;
pub use server::RpcServer;

pub use gamenet_protocol::{Codec, Envelope, Session};

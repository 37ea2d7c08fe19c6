// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages carried inside frames.
//!
//! Every call and reply travels as an [`Envelope`]. Session streams are opened
//! with a [`StreamOpen`] carrying the connection metadata.

use std::collections::HashMap;

/// Metadata key holding the peer identity.
pub const META_NAME: &str = "name";

/// Metadata key holding the decimal user id of an end-user connection.
pub const META_UID: &str = "uid";

/// Reserved peer name for end-user gameplay connections.
pub const AGENT_NAME: &str = "agent";

/// Per-connection user identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Session {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,
}

impl Session {
    pub fn new(user_id: u64) -> Self {
        Self { user_id }
    }
}

/// The wire message for every request and response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// `"<Service>.<Method>"`
    #[prost(string, tag = "1")]
    pub service_method: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub session: Option<Session>,
    /// Human-readable error; set only on failed replies.
    #[prost(string, optional, tag = "4")]
    pub error: Option<String>,
    /// Machine-readable error kind, set together with `error`.
    #[prost(string, optional, tag = "5")]
    pub error_code: Option<String>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(
        service_method: impl Into<String>,
        payload: Vec<u8>,
        session: Option<Session>,
    ) -> Self {
        Self {
            service_method: service_method.into(),
            payload,
            session,
            error: None,
            error_code: None,
        }
    }

    /// Build a successful reply.
    pub fn reply(service_method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::request(service_method, payload, None)
    }

    /// Build a failed reply. The payload is left empty.
    pub fn failure(
        service_method: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service_method: service_method.into(),
            payload: Vec::new(),
            session: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split the target into `(service, method)`.
    pub fn split_service_method(&self) -> Option<(&str, &str)> {
        split_service_method(&self.service_method)
    }
}

/// Split `"Service.Method"` at the last separator.
///
/// Returns `None` when there is no separator or either side is empty.
pub fn split_service_method(full: &str) -> Option<(&str, &str)> {
    let dot = full.rfind('.')?;
    let (service, method) = (&full[..dot], &full[dot + 1..]);
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// First frame of a session stream: connection-establishment metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamOpen {
    #[prost(map = "string, string", tag = "1")]
    pub metadata: HashMap<String, String>,
}

impl StreamOpen {
    pub fn new(metadata: HashMap<String, String>) -> Self {
        Self { metadata }
    }

    /// Metadata for an inter-node connection.
    pub fn named(name: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(META_NAME.to_string(), name.into());
        Self { metadata }
    }

    /// Metadata for an end-user connection.
    pub fn agent(user_id: u64) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(META_NAME.to_string(), AGENT_NAME.to_string());
        metadata.insert(META_UID.to_string(), user_id.to_string());
        Self { metadata }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.get(META_NAME).map(String::as_str)
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.get(META_UID).map(String::as_str)
    }
}

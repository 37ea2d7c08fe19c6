// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gamenet-core.
//!
//! [`RpcError`] is the single taxonomy every public operation returns. Errors
//! cross the wire as an `(error_code, error)` pair on the reply envelope and
//! are rebuilt on the calling side with [`RpcError::from_wire`].

use gamenet_protocol::{ClientError, CodecError, Envelope, FrameError};
use thiserror::Error;

/// Result type using RpcError
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced by the registry, the server and the cluster client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Unknown service, method, node, peer or protocol number.
    #[error("not found: {0}")]
    NotFound(String),

    /// A service with the same derived name is already registered.
    #[error("service '{0}' already registered")]
    AlreadyRegistered(String),

    /// No service name could be derived from the registered type.
    #[error("cannot derive a service name from type '{0}'")]
    AnonymousType(String),

    /// Dialing, writing or reading failed for a reason other than a closed stream.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The stream or connection is gone.
    #[error("stream closed")]
    StreamClosed,

    /// The call did not complete in time.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// A payload or frame could not be decoded.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// The method ran and returned an error (or panicked).
    #[error("{0}")]
    HandlerError(String),

    /// Stream metadata was missing or malformed.
    #[error("invalid stream metadata: {0}")]
    InvalidMetadata(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::AnonymousType(_) => "ANONYMOUS_TYPE",
            Self::TransportFailure(_) => "TRANSPORT_FAILURE",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::Timeout(_) => "TIMEOUT",
            Self::DecodeFailure(_) => "DECODE_FAILURE",
            Self::HandlerError(_) => "HANDLER_ERROR",
            Self::InvalidMetadata(_) => "INVALID_METADATA",
            Self::Config(_) => "CONFIG",
        }
    }

    /// The variant's detail text, as carried in the envelope `error` field.
    pub fn detail(&self) -> String {
        match self {
            Self::NotFound(s)
            | Self::AlreadyRegistered(s)
            | Self::AnonymousType(s)
            | Self::TransportFailure(s)
            | Self::DecodeFailure(s)
            | Self::HandlerError(s)
            | Self::InvalidMetadata(s)
            | Self::Config(s) => s.clone(),
            Self::Timeout(ms) => ms.to_string(),
            Self::StreamClosed => String::new(),
        }
    }

    /// Rebuild an error from a reply envelope's `(error_code, error)` pair.
    ///
    /// A missing or unknown code is treated as a handler error, which is what
    /// a peer that predates error codes sends.
    pub fn from_wire(code: Option<&str>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match code.unwrap_or_default() {
            "NOT_FOUND" => Self::NotFound(detail),
            "ALREADY_REGISTERED" => Self::AlreadyRegistered(detail),
            "ANONYMOUS_TYPE" => Self::AnonymousType(detail),
            "TRANSPORT_FAILURE" => Self::TransportFailure(detail),
            "STREAM_CLOSED" => Self::StreamClosed,
            "TIMEOUT" => Self::Timeout(detail.parse().unwrap_or_default()),
            "DECODE_FAILURE" => Self::DecodeFailure(detail),
            "INVALID_METADATA" => Self::InvalidMetadata(detail),
            "CONFIG" => Self::Config(detail),
            _ => Self::HandlerError(detail),
        }
    }

    /// Build the failed reply envelope for this error.
    pub fn to_envelope(&self, service_method: impl Into<String>) -> Envelope {
        Envelope::failure(service_method, self.error_code(), self.detail())
    }
}

/// Turn a reply envelope into the payload or the typed error it carries.
pub fn into_result(reply: Envelope) -> Result<Vec<u8>> {
    match reply.error {
        Some(detail) => Err(RpcError::from_wire(reply.error_code.as_deref(), detail)),
        None => Ok(reply.payload),
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::DecodeFailure(err.to_string())
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        if err.is_closed() {
            RpcError::StreamClosed
        } else {
            match err {
                FrameError::Decode(e) => RpcError::DecodeFailure(e.to_string()),
                other => RpcError::TransportFailure(other.to_string()),
            }
        }
    }
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        if err.is_closed() {
            return RpcError::StreamClosed;
        }
        match err {
            ClientError::Timeout(ms) => RpcError::Timeout(ms),
            ClientError::Rejected(msg) => RpcError::InvalidMetadata(msg),
            ClientError::Frame(e) => e.into(),
            other => RpcError::TransportFailure(other.to_string()),
        }
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot unary calls: one request frame, one reply frame.

use gamenet_protocol::frame::write_frame;
use gamenet_protocol::{Envelope, Frame};
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::registry::Registry;

/// Dispatch a unary request and write the reply.
///
/// Unary calls always take the positional path; an envelope session is
/// ignored here.
pub(crate) async fn handle<W>(registry: &Registry, request: Frame, writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let reply = match request.decode::<Envelope>() {
        Ok(env) => {
            debug!(method = %env.service_method, "unary request");
            match registry
                .dispatch_unary(&env.service_method, env.payload)
                .await
            {
                Ok(payload) => Envelope::reply(env.service_method, payload),
                Err(e) => {
                    debug!(method = %env.service_method, error = %e, "unary call failed");
                    e.to_envelope(env.service_method)
                }
            }
        }
        Err(e) => RpcError::DecodeFailure(e.to_string()).to_envelope(""),
    };

    let Some(frame) = reply_frame(reply) else {
        return;
    };

    if let Err(e) = write_frame(writer, &frame).await {
        if e.is_closed() {
            debug!("caller went away before the reply");
        } else {
            warn!(error = %e, "failed to write unary reply");
        }
    }
}

/// Encode a reply, replacing it with an error reply if it does not fit in
/// a frame.
pub(crate) fn reply_frame(reply: Envelope) -> Option<Frame> {
    match Frame::response(&reply) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(
                method = %reply.service_method,
                error = %e,
                "reply too large, sending error instead"
            );
            let fallback = RpcError::HandlerError(e.to_string()).to_envelope(reply.service_method);
            Frame::response(&fallback).ok()
        }
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! A unary call uses one QUIC stream carrying one `Request` and one
//! `Response`. A multiplexed session stream starts with an `Open` frame
//! (connection metadata) followed by any number of `Request`/`Response`
//! pairs and server-initiated `Push` frames.
//!
//! Frame layout:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: protobuf payload

use std::io::ErrorKind;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Request envelope
    Request = 1,
    /// Response envelope
    Response = 2,
    /// Stream establishment metadata, first frame of a session stream
    Open = 3,
    /// Unsolicited envelope pushed by the server to a named peer
    Push = 4,
    /// Transport-level rejection (e.g. bad metadata), payload is an envelope
    Error = 5,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Push),
            5 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected message type: expected {expected:?}, got {actual:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether this error means the peer is gone (stream reset, stopped, or
    /// the whole connection lost) as opposed to a malformed frame.
    pub fn is_closed(&self) -> bool {
        match self {
            FrameError::ConnectionClosed => true,
            FrameError::Io(e) => is_closed_kind(e.kind()),
            _ => false,
        }
    }
}

/// IO error kinds produced when the other end of a stream has gone away.
pub fn is_closed_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new request frame
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Create a new response frame
    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    /// Create a stream-open frame
    pub fn open<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Open, msg)
    }

    /// Create a server push frame
    pub fn push<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Push, msg)
    }

    /// Create a new error frame
    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    /// Create a new frame with the given type and message
    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload encodings for typed method arguments and replies.
//!
//! The envelope payload is opaque to the transport. Positional methods encode
//! their arguments and replies with one of these codecs; MessagePack is the
//! compact default, JSON is the text alternative.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors produced while encoding or decoding a payload
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown codec: {0}")]
    Unknown(String),
}

/// Payload encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// MessagePack with named struct fields
    #[default]
    MsgPack,
    /// JSON
    Json,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::MsgPack => "msgpack",
            Codec::Json => "json",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(Codec::MsgPack),
            "json" => Ok(Codec::Json),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        player: u64,
        x: i32,
        y: i32,
        tag: Option<String>,
    }

    fn sample() -> Move {
        Move {
            player: 7,
            x: -3,
            y: 12,
            tag: Some("dash".into()),
        }
    }

    #[test]
    fn test_round_trip_both_codecs() {
        for codec in [Codec::MsgPack, Codec::Json] {
            let bytes = codec.encode(&sample()).unwrap();
            let back: Move = codec.decode(&bytes).unwrap();
            assert_eq!(back, sample(), "codec {codec}");
        }
    }

    #[test]
    fn test_json_is_text() {
        let bytes = Codec::Json.encode(&"hello").unwrap();
        assert_eq!(bytes, br#""hello""#);
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let bytes = Codec::MsgPack.encode(&"not a move").unwrap();
        assert!(Codec::MsgPack.decode::<Move>(&bytes).is_err());
        assert!(Codec::Json.decode::<Move>(b"{}").is_err());
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("msgpack".parse::<Codec>().unwrap(), Codec::MsgPack);
        assert_eq!("JSON".parse::<Codec>().unwrap(), Codec::Json);
        assert!(matches!(
            "xml".parse::<Codec>(),
            Err(CodecError::Unknown(s)) if s == "xml"
        ));
        assert_eq!(Codec::default(), Codec::MsgPack);
    }
}

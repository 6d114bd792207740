//! Wire frames exchanged between RPC clients and servers.
//!
//! Every frame is a `MsgPack` map produced by `rmp_serde::to_vec_named()`,
//! tagged by a `type` field. Transports wrap each encoded frame in a
//! length prefix; nothing here knows about sockets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status::{Code, Status};

/// Per-call metadata: string headers propagated alongside the payload.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying the distributed trace identifier.
pub const TRACE_ID_KEY: &str = "x-trace-id";

/// A unary call issued by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    /// Connection-scoped correlation id, echoed by the response.
    pub id: u64,
    /// Fully qualified method name, e.g. `/greeter.Greeter/SayHello`.
    pub method: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Remaining time budget in milliseconds, if the caller set a deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// The outcome of a unary call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub id: u64,
    pub code: Code,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    /// Builds a successful response.
    #[must_use]
    pub fn ok(id: u64, metadata: Metadata, payload: Vec<u8>) -> Self {
        Self {
            id,
            code: Code::Ok,
            message: String::new(),
            metadata,
            payload,
        }
    }

    /// Builds an error response from a status.
    #[must_use]
    pub fn error(id: u64, status: &Status) -> Self {
        Self {
            id,
            code: status.code,
            message: status.message.clone(),
            metadata: Metadata::new(),
            payload: Vec::new(),
        }
    }

    /// Splits the response into its payload or the carried status.
    ///
    /// # Errors
    ///
    /// Returns the status when `code` is anything other than [`Code::Ok`].
    pub fn into_result(self) -> Result<(Metadata, Vec<u8>), Status> {
        if self.code == Code::Ok {
            Ok((self.metadata, self.payload))
        } else {
            Err(Status::new(self.code, self.message))
        }
    }
}

/// Top-level frame on an RPC connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    /// Keep-alive probe; the peer answers with a `Pong` carrying the same `seq`.
    Ping { seq: u64 },
    Pong { seq: u64 },
    /// The sender will accept no new calls on this connection. Calls already
    /// in flight still receive responses.
    GoAway { reason: String },
}

/// Errors from encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Frame {
    /// Encodes the frame to `MsgPack` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a frame from `MsgPack` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] if the bytes are not a valid frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

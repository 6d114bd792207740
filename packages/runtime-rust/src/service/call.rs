//! The call model every interceptor stage sees, on both sides of the wire.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiff_core::{Metadata, Status};
use tokio::time::Instant;

/// Boxed, sendable future used at the type-erased seams of the pipeline.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one call through a pipeline.
pub type CallResult = Result<Response, Status>;

/// Which end of the connection a pipeline runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unary call on its way through a pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub metadata: Metadata,
    /// Absolute deadline for the call, if any.
    pub deadline: Option<Instant>,
    pub payload: Bytes,
    pub side: Side,
    /// Remote address: the caller on the server side, the chosen backend on
    /// the client side once balancing has happened.
    pub peer: Option<String>,
}

impl Request {
    #[must_use]
    pub fn new(side: Side, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            metadata: Metadata::new(),
            deadline: None,
            payload: payload.into(),
            side,
            peer: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Time left before the deadline; `Some(ZERO)` once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Decodes the payload as a `MsgPack` message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the payload does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        decode_message(&self.payload)
    }
}

/// A successful call result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub metadata: Metadata,
    pub payload: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            metadata: Metadata::new(),
            payload: payload.into(),
        }
    }

    /// Encodes `message` as the response payload.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the message cannot be serialized.
    pub fn encode<T: Serialize>(message: &T) -> Result<Self, Status> {
        Ok(Self::new(encode_message(message)?))
    }

    /// Decodes the payload as a `MsgPack` message.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the payload does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| Status::internal(format!("malformed response payload: {e}")))
    }
}

/// Serializes a message payload with named fields.
///
/// # Errors
///
/// Returns `Internal` if serialization fails.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, Status> {
    rmp_serde::to_vec_named(message)
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("failed to encode payload: {e}")))
}

/// Deserializes a request payload.
///
/// # Errors
///
/// Returns `InvalidArgument` if the bytes do not decode as `T`.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| Status::invalid_argument(format!("malformed request payload: {e}")))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use skiff_core::Code;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    #[test]
    fn payload_helpers_map_errors_to_status_codes() {
        let req = Request::new(
            Side::Server,
            "/greeter/Hello",
            encode_message(&Greeting { name: "ada".into() }).unwrap(),
        );
        assert_eq!(req.decode::<Greeting>().unwrap().name, "ada");

        let bad = Request::new(Side::Server, "/greeter/Hello", Bytes::from_static(b"\xc1"));
        assert_eq!(bad.decode::<Greeting>().unwrap_err().code, Code::InvalidArgument);

        let resp = Response::new(Bytes::from_static(b"\xc1"));
        assert_eq!(resp.decode::<Greeting>().unwrap_err().code, Code::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_saturates_at_zero() {
        let req = Request::new(Side::Client, "m", Bytes::new()).with_timeout(Duration::from_millis(50));
        assert_eq!(req.remaining(), Some(Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(req.remaining(), Some(Duration::ZERO));
        assert_eq!(Request::new(Side::Client, "m", Bytes::new()).remaining(), None);
    }
}

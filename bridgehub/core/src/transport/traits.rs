//! Transport Traits and Errors
//!
//! The seam between the socket plumbing and the code that answers requests.
//! A bridge registers one [`RouteHandler`] per path; the server owns the
//! connection handling and never needs to know what a handler does.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Request parameters carried alongside a path
///
/// Kept as a sorted map so envelopes serialize deterministically.
pub type Params = BTreeMap<String, String>;

/// Errors produced by the transport layer
///
/// These never cross the public `fetch`/`emit` boundary: the client logs
/// them and resolves to `None`. They are visible to code driving the
/// server or the codec directly.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket or filesystem failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Could not connect to a peer endpoint
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the connection before answering
    #[error("connection closed")]
    ConnectionClosed,

    /// Message could not be written to the peer
    #[error("send failed: {0}")]
    SendFailed(String),

    /// JSON encoding/decoding or frame size failure
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Frame payload did not match its CRC32
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received payload
        actual: u32,
    },

    /// Peer credentials did not pass validation
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Handler for one application-level path on the listening side
///
/// The value returned is sent back as the single correlated reply.
/// Handlers report failure by returning `Value::Null` (or an empty
/// collection); the transport does not interpret the payload.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Answer a request for the registered path
    async fn handle(&self, params: Params, body: Value) -> Value;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(Params, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Value> + Send + 'static,
{
    async fn handle(&self, params: Params, body: Value) -> Value {
        (self)(params, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_is_route_handler() {
        let handler = |params: Params, body: Value| async move {
            serde_json::json!({ "id": params.get("id").cloned(), "echo": body })
        };

        let mut params = Params::new();
        params.insert("id".to_string(), "lamp".to_string());

        let reply = handler.handle(params, Value::from(3)).await;
        assert_eq!(reply["id"], "lamp");
        assert_eq!(reply["echo"], 3);
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0x00000001, got 0x00000002"
        );
    }
}

// RPC error taxonomy
// Decode and unmatched-response failures are logged by the engine; the rest
// reach whoever awaited the call

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Payload could not be decoded into an envelope
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote side answered with an error envelope
    #[error("remote error: {0}")]
    Remote(Value),

    /// The remote answered with something the protocol does not allow
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("method `{0}` is reserved")]
    ReservedMethod(String),

    /// The pending entry was dropped before any response arrived
    #[error("call abandoned before a response arrived")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// JSON-RPC error object sent back when a request handler fails
    pub fn to_wire(&self) -> Value {
        match self {
            RpcError::Remote(value) => value.clone(),
            other => serde_json::json!({
                "code": -32603,
                "message": other.to_string(),
            }),
        }
    }
}

//! Minimal JSON-RPC 2.0 envelope.
//!
//! The proxy never interprets MCP payloads; this type only lets command bodies
//! be checked for the JSON-RPC shape and summarized in debug logs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version accepted in the `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request, notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name on requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result on success responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcMessage {
    /// Parses `body` as a single JSON-RPC 2.0 message.
    ///
    /// Returns `None` for batches, non-JSON input and envelopes whose
    /// `jsonrpc` field is not `"2.0"`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body)
            .ok()
            .filter(|msg| msg.jsonrpc == JSONRPC_VERSION)
    }

    /// `true` for requests and notifications.
    pub const fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// `true` for notifications, which carry a method but no id.
    pub const fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}

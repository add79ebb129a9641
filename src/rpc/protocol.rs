//! JSON-RPC 2.0 protocol data model
//!
//! Message shapes, the routing envelope used to peek at inbound frames, and
//! the transport error taxonomy. Payload schemas beyond this are the
//! caller's business; the channel moves raw bytes.

use crate::io::process::ProcessError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
///
/// Identifiers are decimal strings minted by the channel's id counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: String, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object carried in a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// Inbound routing
// ============================================================================

/// Minimal envelope decoded from every inbound frame to discover where it
/// should be routed, before any full typed decode
///
/// `id` present: a response for the correlator. Otherwise `method` present:
/// a notification for the dispatcher. Neither: an unrecognized frame,
/// logged and dropped.
#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub method: Option<String>,
}

/// Wrapper for decoding the `result`/`error` pair of a response once the
/// expected result shape is known
#[derive(Debug, Deserialize)]
pub struct WrappedResponse {
    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// Wrapper for decoding a typed notification payload in a handler
#[derive(Debug, Deserialize)]
pub struct NotificationMessage<P> {
    pub method: String,

    pub params: P,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the channel and its callers
///
/// Transport-level failures (launch, pipe I/O) are global: they terminate
/// the channel and every pending request fails with `ProcessNotRunning`.
/// Per-message failures (`Decoding`, `Server`) only affect the one request
/// whose id matched. Malformed inbound headers never appear here at all;
/// the frame reader treats them as "keep waiting".
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to launch server process: {0}")]
    Launch(#[source] ProcessError),

    #[error("failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("response did not match the expected result shape: {0}")]
    Decoding(#[source] serde_json::Error),

    #[error("missing result in response")]
    MissingResult,

    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("server process is not running")]
    ProcessNotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_without_empty_params() {
        let request = JsonRpcRequest::new("3".to_string(), "shutdown", None);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","id":"3","method":"shutdown"}"#);
    }

    #[test]
    fn test_notification_carries_no_id() {
        let note = JsonRpcNotification::new("exit", None);
        let value = serde_json::to_value(&note).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "exit");
    }

    #[test]
    fn test_envelope_peeks_id() {
        let envelope: MessageEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"12","result":{"ok":true}}"#).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("12"));
        assert!(envelope.method.is_none());
    }

    #[test]
    fn test_envelope_peeks_method() {
        let envelope: MessageEnvelope = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{}}"#,
        )
        .unwrap();
        assert!(envelope.id.is_none());
        assert_eq!(
            envelope.method.as_deref(),
            Some("textDocument/publishDiagnostics")
        );
    }

    #[test]
    fn test_envelope_with_neither_field() {
        let envelope: MessageEnvelope = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(envelope.id.is_none());
        assert!(envelope.method.is_none());
    }

    #[test]
    fn test_wrapped_response_with_error() {
        let wrapped: WrappedResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        assert!(wrapped.result.is_none());
        let error = wrapped.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "method not found");
    }

    #[test]
    fn test_notification_message_typed_decode() {
        #[derive(Debug, Deserialize)]
        struct Params {
            uri: String,
        }

        let message: NotificationMessage<Params> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{"uri":"file:///a.rs"}}"#,
        )
        .unwrap();
        assert_eq!(message.method, "textDocument/publishDiagnostics");
        assert_eq!(message.params.uri, "file:///a.rs");
    }
}

//! WebSocket protocol, JSON-RPC style
//!
//! Wire format:
//!
//! Client → Server (RPC request):
//!   { "id": "req-1", "method": "machine.upgrade", "params": { "image": "repo/installer:v1.2.3" } }
//!
//! Server → Client (RPC response):
//!   { "id": "req-1", "result": { "messages": [ { "ack": "...", "actor_id": "..." } ] } }
//!   { "id": "req-1", "error": { "code": -32010, "message": "not installed" } }
//!
//! Server → Client (Event push, no id):
//!   { "event": "machine", "data": { "id": 7, "actor_id": "...", "payload": { "type": "sequence", ... } } }
//!   { "event": "resources", "data": { "namespace": "secrets", "type": "KubeletSecrets", "items": [...] } }
//!
//! Authentication:
//!   { "token": "secret" }  (shorthand)
//!   { "id": "1", "method": "auth", "params": { "token": "secret" } }  (RPC style)

use serde::{Deserialize, Serialize};

use crate::api::MachineEvent;
use crate::error::{Error, CODE_AUTH, CODE_INTERNAL, CODE_METHOD_NOT_FOUND};
use crate::types::{Resource, ResourceKind};

// ---------------------------------------------------------------------------
// Client → Server: JSON-RPC style
// ---------------------------------------------------------------------------

/// RPC request from client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client: RPC response
// ---------------------------------------------------------------------------

/// RPC response to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful response with a result value.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Error response carrying the code of a typed error.
    pub fn from_error(id: impl Into<String>, error: &Error) -> Self {
        Self::err(id, error.rpc_code(), error.to_string())
    }

    /// Shorthand for a method-not-found error.
    pub fn method_not_found(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, CODE_METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Shorthand for an internal error.
    pub fn internal_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::err(id, CODE_INTERNAL, message)
    }

    /// Shorthand for an auth error.
    pub fn auth_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::err(id, CODE_AUTH, message)
    }

    /// Unwrap into the result value or a remote error.
    pub fn into_result(self) -> crate::Result<serde_json::Value> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(Error::Remote {
                code: err.code,
                message: err.message,
            }),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Server → Client: Event push
// ---------------------------------------------------------------------------

/// Server-pushed event (no id, no request correlation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub data: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Machine event push.
    pub fn machine(event: &MachineEvent) -> Self {
        Self::new(
            "machine",
            serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Full listing of a watched kind, pushed on every change.
    pub fn resources(kind: &ResourceKind, items: &[Resource]) -> Self {
        Self::new(
            "resources",
            serde_json::json!({
                "namespace": kind.namespace,
                "type": kind.resource_type,
                "items": items,
            }),
        )
    }

    /// Auth result event (for shorthand auth without RPC id).
    pub fn auth_result(ok: bool, error: Option<&str>) -> Self {
        Self::new("auth", serde_json::json!({ "ok": ok, "error": error }))
    }

    /// Info event (sent on connection).
    pub fn info(version: &str, mode: &str) -> Self {
        Self::new(
            "info",
            serde_json::json!({ "version": version, "mode": mode }),
        )
    }

    /// Pong event.
    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }

    /// Decode a machine event push.
    pub fn as_machine_event(&self) -> Option<MachineEvent> {
        if self.event != "machine" {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Incoming message: either an RPC or the auth shorthand
// ---------------------------------------------------------------------------

/// Unified incoming message. Serde tries RPC first, then Auth shorthand.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    /// Full RPC request: { "id": "...", "method": "...", "params": ... }
    Rpc(RpcRequest),
    /// Auth shorthand: { "token": "..." } or { "token": null }
    Auth { token: Option<String> },
}

/// Anything the server sends, as seen by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(RpcResponse),
    Event(EventMessage),
}

// ABOUTME: Wire envelope exchanged over the middleware WebSocket
//
// One JSON text frame is one Envelope. Request/response pairs carry an `id`,
// connection-lifecycle messages (connect/connected) do not, and pushed
// collection updates (added/changed/removed) are routed by `collection`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version sent in the `connect` handshake
pub const PROTOCOL_VERSION: &str = "1";

/// Message kinds that appear in the `msg` field.
pub mod kind {
    /// Client handshake request
    pub const CONNECT: &str = "connect";
    /// Server handshake acknowledgement
    pub const CONNECTED: &str = "connected";
    /// Client method call
    pub const METHOD: &str = "method";
    /// Server method result
    pub const RESULT: &str = "result";
    /// Pushed: item added to a collection
    pub const ADDED: &str = "added";
    /// Pushed: item changed in a collection
    pub const CHANGED: &str = "changed";
    /// Pushed: item removed from a collection
    pub const REMOVED: &str = "removed";
    /// Server rejected the handshake
    pub const FAILED: &str = "failed";
}

/// One message unit on the socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id on method calls and their responses; the item id on
    /// pushed collection updates (which may be any JSON scalar)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Message kind (see [`kind`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Collection name on pushed updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Changed fields on pushed updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Session token in the `connected` reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Vec<String>>,
}

impl Envelope {
    /// Build the handshake envelope.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            msg: Some(kind::CONNECT.to_string()),
            version: Some(PROTOCOL_VERSION.to_string()),
            support: Some(vec![PROTOCOL_VERSION.to_string()]),
            ..Self::default()
        }
    }

    /// Build a method call envelope.
    #[must_use]
    pub fn method(id: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Some(Value::String(id.into())),
            msg: Some(kind::METHOD.to_string()),
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Build a successful result envelope (used by test servers).
    #[must_use]
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(Value::String(id.into())),
            msg: Some(kind::RESULT.to_string()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Build an error result envelope (used by test servers).
    #[must_use]
    pub fn error(id: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            id: Some(Value::String(id.into())),
            msg: Some(kind::RESULT.to_string()),
            error: Some(error),
            ..Self::default()
        }
    }

    /// The `msg` field, or an empty string.
    #[must_use]
    pub fn msg(&self) -> &str {
        self.msg.as_deref().unwrap_or_default()
    }

    /// Non-empty correlation id, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<&str> {
        self.id.as_ref().and_then(Value::as_str).filter(|id| !id.is_empty())
    }

    /// True for pushed collection updates.
    #[must_use]
    pub fn is_collection_update(&self) -> bool {
        self.collection.is_some()
            && matches!(self.msg(), kind::ADDED | kind::CHANGED | kind::REMOVED)
    }
}

/// Server-side error attached to a failed method call.
///
/// On the wire: `{"error": code, "message": ..., "reason": ..., "errorType": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "error", default)]
    pub code: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(rename = "errorType", alias = "type", default, skip_serializing_if = "String::is_empty")]
    pub error_type: String,
}

impl ErrorDetail {
    /// Create an error with a code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match (self.message.is_empty(), self.reason.is_empty()) {
            (false, false) if self.message != self.reason => {
                format!("{}: {}", self.message, self.reason)
            }
            (false, _) => self.message.clone(),
            (true, false) => self.reason.clone(),
            (true, true) => "unknown error".to_string(),
        };

        if self.error_type.is_empty() {
            write!(f, "[{}] {text}", self.code)
        } else {
            write!(f, "[{}] {text} ({})", self.code, self.error_type)
        }
    }
}

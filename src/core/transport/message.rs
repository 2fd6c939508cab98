//! JSON-RPC message envelopes carried by the streamable transport.
//!
//! A message is a request (id + method), a response (id + result or error)
//! or a notification (method, no id). Responses correlate to requests by id;
//! notifications are never answered.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{TransportError, TransportResult};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name that opens a new session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// JSON-RPC request structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC notification structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Method not found error.
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, -32601, format!("Method not found: {method}"))
    }

    /// Invalid request error.
    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, -32600, "Invalid Request")
    }

    /// Invalid params error.
    pub fn invalid_params(id: Value, msg: impl Into<String>) -> Self {
        Self::error(id, -32602, msg)
    }

    /// Internal error.
    pub fn internal_error(id: Value, msg: impl Into<String>) -> Self {
        Self::error(id, -32603, msg)
    }
}

/// Any message that can travel over the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parse one message from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> TransportResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Classify a JSON value into a message.
    ///
    /// Anything with a `method` is a request when it also carries an `id`,
    /// otherwise a notification. Without `method`, an `id` plus `result` or
    /// `error` makes a response.
    pub fn from_value(value: Value) -> TransportResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TransportError::protocol("message must be a JSON object"))?;

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => return Err(TransportError::protocol("jsonrpc must be \"2.0\"")),
        }

        let has_method = object.get("method").is_some_and(Value::is_string);
        let has_id = object.contains_key("id");

        let message = if has_method && has_id {
            Self::Request(serde_json::from_value(value)?)
        } else if has_method {
            Self::Notification(serde_json::from_value(value)?)
        } else if has_id && (object.contains_key("result") || object.contains_key("error")) {
            Self::Response(serde_json::from_value(value)?)
        } else {
            return Err(TransportError::protocol(
                "message is neither a request, a response nor a notification",
            ));
        };

        Ok(message)
    }

    /// Whether this message is a notification (no correlating id).
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification(_))
    }

    /// Whether this message is a request expecting a response.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Whether this message opens a new protocol session.
    pub fn is_initialize_request(&self) -> bool {
        matches!(self, Self::Request(r) if r.method == INITIALIZE_METHOD)
    }

    /// Method name of requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Correlation id of requests and responses.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        Self::Notification(notification)
    }
}

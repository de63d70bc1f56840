use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod capability;
pub mod events;
pub mod messages;

pub use capability::{validate_parameters, CapabilityDescriptor, SharedMemoryRequirement};
pub use events::HostEvent;
pub use messages::{
    ApplySegmentResult, BackpressureLevel, CapabilitiesResult, ConnectResult, ControlRequest,
    HostNotification,
};

/// JSON-RPC error codes used on the control channel.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "jsonrpc")]
pub enum JsonRpcMessage {
    #[serde(rename = "2.0")]
    V2(JsonRpcV2Message),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcV2Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: JsonRpcId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl JsonRpcMessage {
    pub fn request(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Request(request))
    }

    pub fn response(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Response(response))
    }

    /// Serialize as one newline-terminated line, the framing of the control channel.
    pub fn to_line(&self) -> serde_json::Result<bytes::Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(bytes::Bytes::from(line))
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

//! Requests the supervisor sends to a host over the control channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CapabilityDescriptor, JsonRpcId, JsonRpcRequest};
use crate::shm::SegmentDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    #[default]
    None,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostNotification {
    LocaleChanged {
        locale: String,
    },
    #[serde(rename_all = "camelCase")]
    SettingsChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin_id: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Closed catalog of control requests. The method name is the variant in
/// kebab-case; the fields travel as the JSON-RPC `params` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum ControlRequest {
    Ping,
    GetCapabilities,
    #[serde(rename_all = "camelCase")]
    Connect {
        capability_id: String,
        #[serde(default)]
        parameters: Value,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Disconnect {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetUiState {
        capability_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        view_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApplySharedMemorySegment {
        session_id: String,
        descriptor: SegmentDescriptor,
    },
    #[serde(rename_all = "camelCase")]
    SetBackpressure {
        session_id: String,
        level: BackpressureLevel,
    },
    Notify {
        notification: HostNotification,
    },
    Shutdown,
}

impl ControlRequest {
    pub fn method_name(&self) -> &'static str {
        match self {
            ControlRequest::Ping => "ping",
            ControlRequest::GetCapabilities => "get-capabilities",
            ControlRequest::Connect { .. } => "connect",
            ControlRequest::Disconnect { .. } => "disconnect",
            ControlRequest::GetUiState { .. } => "get-ui-state",
            ControlRequest::ApplySharedMemorySegment { .. } => "apply-shared-memory-segment",
            ControlRequest::SetBackpressure { .. } => "set-backpressure",
            ControlRequest::Notify { .. } => "notify",
            ControlRequest::Shutdown => "shutdown",
        }
    }

    pub fn to_jsonrpc(&self, id: JsonRpcId) -> serde_json::Result<JsonRpcRequest> {
        let mut value = serde_json::to_value(self)?;
        let params = value
            .as_object_mut()
            .and_then(|object| object.remove("params"))
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(JsonRpcRequest {
            id,
            method: self.method_name().to_string(),
            params: Some(params),
        })
    }

    pub fn from_jsonrpc(request: &JsonRpcRequest) -> serde_json::Result<Self> {
        let mut object = Map::new();
        object.insert("method".to_string(), Value::String(request.method.clone()));
        match &request.params {
            None | Some(Value::Null) => {}
            // Parameterless requests arrive with `{}`.
            Some(Value::Object(params)) if params.is_empty() => {}
            Some(params) => {
                object.insert("params".to_string(), params.clone());
            }
        }
        serde_json::from_value(Value::Object(object))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CapabilitiesResult {
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySegmentResult {
    pub accepted: bool,
    /// Bytes the host will actually use; absent means the full descriptor capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_bytes: Option<u64>,
}

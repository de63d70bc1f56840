use serde::{Deserialize, Serialize};

/// Fire-and-forget messages a host pushes over its event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    #[serde(rename_all = "camelCase")]
    HostRegistered { token: String, process_id: u32 },
    #[serde(rename_all = "camelCase")]
    SessionRegistered {
        token: String,
        process_id: u32,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UiStateInvalidated {
        capability_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        view_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::HostRegistered { .. } => "host-registered",
            HostEvent::SessionRegistered { .. } => "session-registered",
            HostEvent::UiStateInvalidated { .. } => "ui-state-invalidated",
        }
    }
}

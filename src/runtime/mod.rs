//! Host process supervision: launching, the per-plugin state machine, session
//! bookkeeping and the supervisor facade over every plugin.

use serde::Serialize;

pub mod launcher;
pub mod plugin;
pub mod process;
pub mod sessions;
pub mod supervisor;

pub use launcher::{HostLauncher, LaunchSpec, LaunchedHost, ProcessLauncher};
pub use plugin::{NotifyOutcome, PluginRuntime, RuntimeContext, RuntimeSnapshot};
pub use process::{ProcessControl, ProcessExit, ProcessHandle};
pub use sessions::{SessionStatus, SessionTable};
pub use supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Loaded,
    Disabled,
    Failed,
}

/// Change notifications for UI layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SupervisorEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        plugin_id: String,
        status: RuntimeStatus,
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionRegistered {
        plugin_id: String,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        plugin_id: String,
        session_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    UiStateInvalidated {
        plugin_id: String,
        capability_id: String,
        session_id: Option<String>,
        view_id: Option<String>,
        reason: Option<String>,
    },
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-capability shared memory size overriding the capability's own request.
    #[serde(default)]
    pub shared_memory_hints: HashMap<String, u64>,
    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_ms: u64,
    #[serde(default = "default_registration_poll_interval")]
    pub registration_poll_interval_ms: u64,
    #[serde(default = "default_capabilities_timeout")]
    pub capabilities_timeout_ms: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_session_registration_timeout")]
    pub session_registration_timeout_ms: u64,
    #[serde(default = "default_best_effort_timeout")]
    pub best_effort_timeout_ms: u64,
    #[serde(default = "default_exit_wait")]
    pub exit_wait_ms: u64,
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_ms: u64,
    /// Directory for event sockets. Defaults to the user runtime directory.
    #[serde(default)]
    pub runtime_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedMemoryConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reader_stop_timeout")]
    pub reader_stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_signal_timeout")]
    pub signal_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    /// When set, logs also go to a daily rolling file in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_enabled() -> bool {
    true
}

fn default_restart_on_failure() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay() -> u64 {
    5000
}

fn default_ping_timeout() -> u64 {
    5000
}

fn default_registration_timeout() -> u64 {
    10000
}

fn default_registration_poll_interval() -> u64 {
    25
}

fn default_capabilities_timeout() -> u64 {
    5000
}

fn default_call_timeout() -> u64 {
    10000
}

fn default_session_registration_timeout() -> u64 {
    5000
}

fn default_best_effort_timeout() -> u64 {
    1000
}

fn default_exit_wait() -> u64 {
    3000
}

fn default_terminate_grace() -> u64 {
    2000
}

fn default_page_size() -> u64 {
    4096
}

fn default_poll_interval() -> u64 {
    2
}

fn default_reader_stop_timeout() -> u64 {
    500
}

fn default_medium_threshold() -> f64 {
    0.5
}

fn default_high_threshold() -> f64 {
    0.85
}

fn default_signal_timeout() -> u64 {
    150
}

fn default_file_prefix() -> String {
    "plugin-supervisor".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_ping_timeout(),
            registration_timeout_ms: default_registration_timeout(),
            registration_poll_interval_ms: default_registration_poll_interval(),
            capabilities_timeout_ms: default_capabilities_timeout(),
            call_timeout_ms: default_call_timeout(),
            session_registration_timeout_ms: default_session_registration_timeout(),
            best_effort_timeout_ms: default_best_effort_timeout(),
            exit_wait_ms: default_exit_wait(),
            terminate_grace_ms: default_terminate_grace(),
            runtime_directory: None,
        }
    }
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            directory: None,
            page_size: default_page_size(),
            poll_interval_ms: default_poll_interval(),
            reader_stop_timeout_ms: default_reader_stop_timeout(),
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            signal_timeout_ms: default_signal_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            directory: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl PluginConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            enabled: default_enabled(),
            shared_memory_hints: HashMap::new(),
            restart_on_failure: default_restart_on_failure(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay(),
        }
    }

    /// Linear backoff: the n-th restart (0-based) waits `restartDelayMs * (n + 1)`.
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.restart_delay_ms.saturating_mul(u64::from(attempt) + 1))
    }
}

fn base_runtime_directory() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("plugin-supervisor")
}

impl SupervisorConfig {
    pub fn event_socket_directory(&self) -> PathBuf {
        self.runtime_directory
            .clone()
            .unwrap_or_else(base_runtime_directory)
            .join("events")
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn registration_poll_interval(&self) -> Duration {
        Duration::from_millis(self.registration_poll_interval_ms)
    }

    pub fn capabilities_timeout(&self) -> Duration {
        Duration::from_millis(self.capabilities_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn session_registration_timeout(&self) -> Duration {
        Duration::from_millis(self.session_registration_timeout_ms)
    }

    pub fn best_effort_timeout(&self) -> Duration {
        Duration::from_millis(self.best_effort_timeout_ms)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl SharedMemoryConfig {
    pub fn segment_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| base_runtime_directory().join("segments"))
    }
}

impl BackpressureConfig {
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }
}

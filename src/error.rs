use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    #[error("Shared memory error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin is disabled: {0}")]
    PluginDisabled(String),

    #[error("Plugin not loaded: {0}")]
    PluginNotLoaded(String),

    #[error("Failed to start plugin {plugin}: {reason}")]
    StartFailed { plugin: String, reason: String },

    #[error("Plugin {0} never confirmed its host registration")]
    HostRegistrationTimeout(String),

    #[error("Call to plugin {plugin} failed: {source} (recovered: {recovered})")]
    CallFailed {
        plugin: String,
        #[source]
        source: ControlError,
        recovered: bool,
    },

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format")]
    InvalidFormat,
}

/// Failure of a single control-plane call. Never panics across the client API.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: &'static str, timeout_ms: u64 },

    #[error("control channel closed")]
    Closed,

    #[error("failed to send {method}: {reason}")]
    Send { method: &'static str, reason: String },

    #[error("malformed response to {method}: {reason}")]
    Malformed { method: &'static str, reason: String },

    #[error("host returned error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl ControlError {
    /// Timeouts and dead channels point at a sick host process rather than a
    /// rejected request, so the supervisor answers them with a restart.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::Timeout { .. } | ControlError::Closed | ControlError::Send { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("invalid segment size: {0}")]
    InvalidSize(u64),

    #[error("frame of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("empty frames cannot be written")]
    EmptyFrame,

    #[error("invalid segment header: {0}")]
    InvalidHeader(String),

    #[error("segment size mismatch: expected {expected}, mapped {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capability {capability} not offered by plugin {plugin}")]
    CapabilityNotFound { plugin: String, capability: String },

    #[error("capability {0} only supports one session and one is already open")]
    ExclusiveSessionActive(String),

    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),

    #[error("host rejected connect: {0}")]
    ConnectRejected(String),

    #[error("protocol violation: expected session {expected}, host answered {actual:?}")]
    ProtocolViolation {
        expected: String,
        actual: Option<String>,
    },

    #[error("session {0} was never confirmed by the host")]
    RegistrationTimeout(String),

    #[error("host refused shared memory segment for session {0}")]
    SegmentRejected(String),

    #[error("host granted {granted} bytes, capability requires at least {minimum}")]
    InsufficientSegment { granted: u64, minimum: u64 },

    #[error("shared memory allocation failed: {0}")]
    Segment(#[from] SegmentError),

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

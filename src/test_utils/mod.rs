//! In-process fake hosts for exercising the supervisor without spawning
//! processes. Fake hosts run the real [`host::serve`](crate::host::serve) loop
//! over `tokio::io::duplex` pipes and report events through an in-memory
//! channel, so everything above the launcher runs unchanged.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::config::{Config, PluginConfig, SharedMemoryConfig, SupervisorConfig};
use crate::error::{Result, SupervisorError, TransportError};
use crate::host::{self, ControlHandler, EventSink, HandlerError, HandlerResult, HostContext};
use crate::protocol::{
    CapabilityDescriptor, ControlRequest, HostEvent, SharedMemoryRequirement,
};
use crate::runtime::{HostLauncher, LaunchSpec, LaunchedHost, ProcessExit, ProcessHandle};
use crate::shm::SharedMemorySegment;
use crate::transport::{Connection, LineConnection};

const PIPE_CAPACITY: usize = 1024 * 1024;
const FIRST_FAKE_PID: u32 = 40_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingBehavior {
    Answer,
    Fail,
    Hang,
}

/// What the fake host does with its own `host-registered` announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    Correct,
    Skip,
    WrongToken,
}

/// Script for one fake host generation.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub fail_launch: bool,
    pub ping: PingBehavior,
    pub announce: Announce,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub fail_capabilities: bool,
    pub confirm_sessions: bool,
    pub echo_session_id: bool,
    pub accept_segments: bool,
    /// `grantedBytes` answered to successive segment offers; afterwards the
    /// field is omitted, which grants the full capacity.
    pub grants: Vec<u64>,
    pub fail_notify: bool,
    /// Frames written into every accepted segment.
    pub frames: Vec<Vec<u8>>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            fail_launch: false,
            ping: PingBehavior::Answer,
            announce: Announce::Correct,
            capabilities: vec![streaming_capability(), console_capability()],
            fail_capabilities: false,
            confirm_sessions: true,
            echo_session_id: true,
            accept_segments: true,
            grants: Vec::new(),
            fail_notify: false,
            frames: Vec::new(),
        }
    }
}

/// Multi-session capability with a 4 KiB minimum and 64 KiB preferred ring.
pub fn streaming_capability() -> CapabilityDescriptor {
    CapabilityDescriptor {
        id: "stream".to_string(),
        display_name: "Stream".to_string(),
        parameter_schema: json!({
            "type": "object",
            "properties": { "rate": { "type": "integer" } }
        }),
        shared_memory: Some(SharedMemoryRequirement {
            min_bytes: 4096,
            preferred_bytes: Some(65536),
        }),
        supports_multiple_sessions: true,
        data_format: Some("binary".to_string()),
    }
}

/// Single-session capability without shared memory.
pub fn console_capability() -> CapabilityDescriptor {
    CapabilityDescriptor {
        id: "console".to_string(),
        display_name: "Console".to_string(),
        parameter_schema: json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        }),
        shared_memory: None,
        supports_multiple_sessions: false,
        data_format: Some("text".to_string()),
    }
}

/// Configuration with short timeouts and every directory under `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config {
        supervisor: SupervisorConfig {
            ping_timeout_ms: 500,
            registration_timeout_ms: 500,
            registration_poll_interval_ms: 5,
            capabilities_timeout_ms: 500,
            call_timeout_ms: 500,
            session_registration_timeout_ms: 300,
            best_effort_timeout_ms: 200,
            exit_wait_ms: 500,
            terminate_grace_ms: 200,
            runtime_directory: Some(dir.join("run")),
        },
        shared_memory: SharedMemoryConfig {
            directory: Some(dir.join("segments")),
            poll_interval_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A plugin entry that restarts quickly after a crash.
pub fn fake_plugin() -> PluginConfig {
    let mut config = PluginConfig::new("fake-host");
    config.restart_delay_ms = 20;
    config
}

pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handle on one launched fake host generation.
#[derive(Clone)]
pub struct FakeHost {
    pub plugin_id: String,
    pub token: String,
    pub pid: u32,
    pub process: ProcessHandle,
    requests: Arc<Mutex<Vec<ControlRequest>>>,
    events: mpsc::UnboundedSender<HostEvent>,
    crash: Arc<Notify>,
}

impl FakeHost {
    pub fn requests(&self) -> Vec<ControlRequest> {
        lock(&self.requests).clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        lock(&self.requests)
            .iter()
            .map(ControlRequest::method_name)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| **m == method).count()
    }

    /// Inject an event as if the host had sent it.
    pub fn send_event(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// Make the process die with exit code 1.
    pub fn crash(&self) {
        self.crash.notify_one();
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }
}

/// Launcher whose hosts live in the test process.
pub struct FakeLauncher {
    default_behavior: Mutex<FakeBehavior>,
    queued: Mutex<VecDeque<FakeBehavior>>,
    hosts: Mutex<Vec<FakeHost>>,
    specs: Mutex<Vec<LaunchSpec>>,
    next_pid: AtomicU32,
    launches: AtomicUsize,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new(FakeBehavior::default())
    }
}

impl FakeLauncher {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            default_behavior: Mutex::new(behavior),
            queued: Mutex::new(VecDeque::new()),
            hosts: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            launches: AtomicUsize::new(0),
        }
    }

    /// Behavior for every later launch without a queued script.
    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *lock(&self.default_behavior) = behavior;
    }

    /// Behavior for the next launch only.
    pub fn queue_behavior(&self, behavior: FakeBehavior) {
        lock(&self.queued).push_back(behavior);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn hosts(&self) -> Vec<FakeHost> {
        lock(&self.hosts).clone()
    }

    pub fn last_host(&self) -> Option<FakeHost> {
        lock(&self.hosts).last().cloned()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        lock(&self.specs).clone()
    }

    fn next_behavior(&self) -> FakeBehavior {
        lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| lock(&self.default_behavior).clone())
    }
}

#[async_trait]
impl HostLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedHost> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        lock(&self.specs).push(spec.clone());
        let behavior = self.next_behavior();
        if behavior.fail_launch {
            return Err(SupervisorError::StartFailed {
                plugin: spec.plugin_id.clone(),
                reason: "fake launch failure".to_string(),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (process, control) = ProcessHandle::channel(pid);

        let (host_io, supervisor_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (supervisor_read, supervisor_write) = tokio::io::split(supervisor_io);
        let host_connection: Arc<dyn Connection> =
            Arc::new(LineConnection::new(host_read, host_write));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(FakeEventSink {
            events: events_tx.clone(),
            announce: behavior.announce,
        });
        let ctx = HostContext::new(spec.plugin_id.clone(), spec.host_token.clone(), pid, sink);

        let requests = Arc::new(Mutex::new(Vec::new()));
        let crash = Arc::new(Notify::new());
        let handler = Arc::new(FakeHandler {
            grants: Mutex::new(behavior.grants.iter().copied().collect()),
            behavior,
            requests: requests.clone(),
            segments: Mutex::new(HashMap::new()),
        });

        let host = FakeHost {
            plugin_id: spec.plugin_id.clone(),
            token: spec.host_token.clone(),
            pid,
            process: process.clone(),
            requests,
            events: events_tx,
            crash: crash.clone(),
        };
        lock(&self.hosts).push(host);

        tokio::spawn(async move {
            let exit = tokio::select! {
                _ = control.terminate_requested() => ProcessExit { code: None, signal: Some(15) },
                _ = crash.notified() => ProcessExit { code: Some(1), signal: None },
                result = host::serve(handler, ctx, host_connection.clone()) => {
                    if let Err(e) = result {
                        tracing::debug!(pid, "Fake host stopped with error: {}", e);
                    }
                    ProcessExit { code: Some(0), signal: None }
                }
            };
            let _ = host_connection.close().await;
            control.exited(exit);
        });

        Ok(LaunchedHost {
            process,
            control: Arc::new(LineConnection::new(supervisor_read, supervisor_write)),
            events: events_rx,
            event_listener: None,
        })
    }
}

struct FakeEventSink {
    events: mpsc::UnboundedSender<HostEvent>,
    announce: Announce,
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn emit(&self, event: &HostEvent) -> Result<()> {
        let event = match (event, self.announce) {
            (HostEvent::HostRegistered { .. }, Announce::Skip) => return Ok(()),
            (HostEvent::HostRegistered { process_id, .. }, Announce::WrongToken) => {
                HostEvent::HostRegistered {
                    token: "not-the-launch-token".to_string(),
                    process_id: *process_id,
                }
            }
            (event, _) => event.clone(),
        };
        self.events
            .send(event)
            .map_err(|_| TransportError::Closed.into())
    }
}

struct FakeHandler {
    behavior: FakeBehavior,
    requests: Arc<Mutex<Vec<ControlRequest>>>,
    grants: Mutex<VecDeque<u64>>,
    segments: Mutex<HashMap<String, Arc<SharedMemorySegment>>>,
}

impl FakeHandler {
    fn start_writer(&self, session_id: &str, segment: Arc<SharedMemorySegment>) {
        lock(&self.segments).insert(session_id.to_string(), segment.clone());
        let frames = self.behavior.frames.clone();
        if frames.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for frame in frames {
                loop {
                    match segment.try_write_frame(&frame) {
                        Ok(Some(_)) => break,
                        Ok(None) => tokio::time::sleep(Duration::from_millis(1)).await,
                        Err(e) => {
                            tracing::debug!("Fake host could not write frame: {}", e);
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ControlHandler for FakeHandler {
    async fn handle(&self, ctx: &HostContext, request: ControlRequest) -> HandlerResult {
        lock(&self.requests).push(request.clone());

        match request {
            ControlRequest::Ping => match self.behavior.ping {
                PingBehavior::Answer => Ok(json!({})),
                PingBehavior::Fail => Err(HandlerError::internal("ping refused")),
                PingBehavior::Hang => std::future::pending().await,
            },
            ControlRequest::GetCapabilities => {
                if self.behavior.fail_capabilities {
                    return Err(HandlerError::internal("capabilities unavailable"));
                }
                Ok(json!({ "capabilities": self.behavior.capabilities }))
            }
            ControlRequest::Connect { session_id, .. } => {
                if self.behavior.confirm_sessions {
                    ctx.register_session(&session_id)
                        .await
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                }
                let echoed = if self.behavior.echo_session_id {
                    session_id
                } else {
                    format!("{}-imposter", session_id)
                };
                Ok(json!({ "sessionId": echoed }))
            }
            ControlRequest::Disconnect { session_id, .. } => {
                lock(&self.segments).remove(&session_id);
                Ok(json!({}))
            }
            ControlRequest::GetUiState {
                capability_id,
                session_id,
                view_id,
            } => Ok(json!({
                "capabilityId": capability_id,
                "sessionId": session_id,
                "viewId": view_id,
            })),
            ControlRequest::ApplySharedMemorySegment {
                session_id,
                descriptor,
            } => {
                if !self.behavior.accept_segments {
                    return Ok(json!({ "accepted": false }));
                }
                let segment = SharedMemorySegment::open(&descriptor)
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                self.start_writer(&session_id, Arc::new(segment));
                let grant = lock(&self.grants).pop_front();
                Ok(match grant {
                    Some(granted) => json!({ "accepted": true, "grantedBytes": granted }),
                    None => json!({ "accepted": true }),
                })
            }
            ControlRequest::SetBackpressure { .. } => Ok(json!({})),
            ControlRequest::Notify { .. } => {
                if self.behavior.fail_notify {
                    Err(HandlerError::internal("notification handler crashed"))
                } else {
                    Ok(json!({}))
                }
            }
            ControlRequest::Shutdown => Ok(Value::Object(Default::default())),
        }
    }
}

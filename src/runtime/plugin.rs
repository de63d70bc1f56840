use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::launcher::{HostLauncher, LaunchSpec};
use super::process::{ProcessExit, ProcessHandle};
use super::sessions::{EndedSession, SessionResource, SessionTable};
use super::{RuntimeStatus, SupervisorEvent};
use crate::config::{PluginConfig, SupervisorConfig};
use crate::control::ControlClient;
use crate::error::{ControlError, Result, SessionError, SupervisorError};
use crate::metrics::Metrics;
use crate::protocol::{
    validate_parameters, BackpressureLevel, CapabilityDescriptor, HostEvent, HostNotification,
};
use crate::shm::SegmentSessionService;
use crate::transport::EventListener;

/// Longest plugin id fragment used in an event socket name.
const SOCKET_TAG_LEN: usize = 32;

/// Collaborators shared by every runtime of one supervisor.
#[derive(Clone)]
pub struct RuntimeContext {
    pub launcher: Arc<dyn HostLauncher>,
    pub segments: Arc<SegmentSessionService>,
    pub settings: SupervisorConfig,
    pub events: broadcast::Sender<SupervisorEvent>,
    pub metrics: Arc<Metrics>,
    /// Session id to owning plugin id, across all runtimes.
    pub session_owners: Arc<DashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub plugin_id: String,
    pub status: RuntimeStatus,
    pub error: Option<String>,
    pub capabilities_error: Option<String>,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub open_sessions: Vec<String>,
    pub registered_sessions: Vec<String>,
    pub restart_count: u32,
    pub process_id: Option<u32>,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyOutcome {
    pub plugin_id: String,
    pub error: Option<String>,
    pub restarted: bool,
}

/// One live host process generation.
struct Host {
    generation: u64,
    process: ProcessHandle,
    control: Arc<ControlClient>,
    event_pump: JoinHandle<()>,
    event_listener: Option<EventListener>,
}

struct RuntimeState {
    status: RuntimeStatus,
    error: Option<String>,
    capabilities_error: Option<String>,
    generation: u64,
    token: Option<String>,
    host: Option<Host>,
    host_registered: bool,
    /// Process id announced by `host-registered`.
    host_process_id: Option<u32>,
    /// Set when the host died on its own; cleared by the next successful start.
    crashed: bool,
    restart_count: u32,
    shutting_down: bool,
}

/// Supervises the host process of one plugin.
///
/// Start, restart and shutdown are serialized by the lifecycle lock; connect
/// and disconnect by the session gate. Neither lock is taken while holding the
/// state mutex, and the state mutex is never held across an await.
pub struct PluginRuntime {
    id: String,
    config: PluginConfig,
    ctx: RuntimeContext,
    weak: Weak<PluginRuntime>,
    lifecycle: tokio::sync::Mutex<()>,
    session_gate: tokio::sync::Mutex<()>,
    state: Mutex<RuntimeState>,
    capabilities: ArcSwap<Vec<CapabilityDescriptor>>,
    sessions: SessionTable,
}

impl PluginRuntime {
    pub fn new(id: impl Into<String>, config: PluginConfig, ctx: RuntimeContext) -> Arc<Self> {
        let status = if config.enabled {
            RuntimeStatus::Failed
        } else {
            RuntimeStatus::Disabled
        };
        if status == RuntimeStatus::Failed {
            ctx.metrics.record_runtime_failed();
        }

        let id = id.into();
        Arc::new_cyclic(|weak| Self {
            id,
            config,
            ctx,
            weak: weak.clone(),
            lifecycle: tokio::sync::Mutex::new(()),
            session_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(RuntimeState {
                status,
                error: None,
                capabilities_error: None,
                generation: 0,
                token: None,
                host: None,
                host_registered: false,
                host_process_id: None,
                crashed: false,
                restart_count: 0,
                shutting_down: false,
            }),
            capabilities: ArcSwap::from_pointee(Vec::new()),
            sessions: SessionTable::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn status(&self) -> RuntimeStatus {
        self.state().status
    }

    pub fn capabilities(&self) -> Arc<Vec<CapabilityDescriptor>> {
        self.capabilities.load_full()
    }

    pub fn capability(&self, capability_id: &str) -> Option<CapabilityDescriptor> {
        self.capabilities
            .load()
            .iter()
            .find(|c| c.id == capability_id)
            .cloned()
    }

    /// Token of the current process generation, if one was launched.
    pub fn current_token(&self) -> Option<String> {
        self.state().token.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn process_id(&self) -> Option<u32> {
        self.state().host.as_ref().map(|h| h.process.id())
    }

    pub fn is_session_open(&self, session_id: &str) -> bool {
        self.sessions.is_open(session_id)
    }

    pub fn is_session_registered(&self, session_id: &str) -> bool {
        self.sessions.is_registered(session_id)
    }

    /// Loaded runtimes, and runtimes whose host died on its own, receive broadcasts.
    pub fn accepts_notifications(&self) -> bool {
        let state = self.state();
        state.status == RuntimeStatus::Loaded || state.crashed
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let (status, error, capabilities_error, restart_count, process_id, generation) = {
            let state = self.state();
            (
                state.status,
                state.error.clone(),
                state.capabilities_error.clone(),
                state.restart_count,
                state.host.as_ref().map(|h| h.process.id()),
                state.generation,
            )
        };
        RuntimeSnapshot {
            plugin_id: self.id.clone(),
            status,
            error,
            capabilities_error,
            capabilities: self.capabilities.load().as_ref().clone(),
            open_sessions: self.sessions.open_sessions(),
            registered_sessions: self.sessions.registered_sessions(),
            restart_count,
            process_id,
            generation,
        }
    }

    fn set_status(&self, status: RuntimeStatus, error: Option<String>) {
        let changed = {
            let mut state = self.state();
            let previous = state.status;
            let changed = previous != status || state.error != error;
            state.status = status;
            state.error = error.clone();
            if previous != status {
                match previous {
                    RuntimeStatus::Loaded => self.ctx.metrics.record_runtime_unloaded(),
                    RuntimeStatus::Failed => self.ctx.metrics.record_runtime_recovered(),
                    RuntimeStatus::Disabled => {}
                }
                match status {
                    RuntimeStatus::Loaded => self.ctx.metrics.record_runtime_loaded(),
                    RuntimeStatus::Failed => self.ctx.metrics.record_runtime_failed(),
                    RuntimeStatus::Disabled => {}
                }
            }
            changed
        };

        if changed {
            let _ = self.ctx.events.send(SupervisorEvent::StatusChanged {
                plugin_id: self.id.clone(),
                status,
                error,
            });
        }
    }

    fn current_control(&self) -> Option<Arc<ControlClient>> {
        self.state().host.as_ref().map(|h| h.control.clone())
    }

    fn loaded_control(&self) -> Result<Arc<ControlClient>> {
        let state = self.state();
        match (&state.status, &state.host) {
            (RuntimeStatus::Loaded, Some(host)) => Ok(host.control.clone()),
            (RuntimeStatus::Disabled, _) => Err(SupervisorError::PluginDisabled(self.id.clone())),
            _ => Err(SupervisorError::PluginNotLoaded(self.id.clone())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Replace the host process with a fresh generation.
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.count_restart();
        self.start_locked().await
    }

    fn count_restart(&self) {
        self.state().restart_count += 1;
        self.ctx.metrics.record_restart();
    }

    async fn start_locked(&self) -> Result<()> {
        if !self.config.enabled {
            self.set_status(RuntimeStatus::Disabled, None);
            return Err(SupervisorError::PluginDisabled(self.id.clone()));
        }
        if self.state().shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }

        self.teardown("host-restarting").await;

        let token = Uuid::new_v4().to_string();
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.token = Some(token.clone());
            state.host_registered = false;
            state.host_process_id = None;
            state.generation
        };

        let spec = LaunchSpec {
            plugin_id: self.id.clone(),
            command: self.config.command.clone(),
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            working_directory: self.config.working_directory.clone(),
            host_token: token.clone(),
            event_endpoint: self
                .ctx
                .settings
                .event_socket_directory()
                .join(format!("{}-{}.sock", socket_tag(&self.id), &token[..8])),
        };

        let launched = match self.ctx.launcher.launch(&spec).await {
            Ok(launched) => launched,
            Err(e) => {
                let error = match e {
                    SupervisorError::StartFailed { .. } => e,
                    other => SupervisorError::StartFailed {
                        plugin: self.id.clone(),
                        reason: other.to_string(),
                    },
                };
                tracing::error!(plugin = %self.id, generation, "Failed to launch host: {}", error);
                self.set_status(RuntimeStatus::Failed, Some(error.to_string()));
                return Err(error);
            }
        };

        let pid = launched.process.id();
        let control = Arc::new(ControlClient::new(
            self.id.clone(),
            launched.control,
            Some(self.ctx.metrics.clone()),
        ));
        let event_pump = tokio::spawn(pump_events(self.weak.clone(), generation, launched.events));
        tokio::spawn(watch_exit(
            self.weak.clone(),
            generation,
            launched.process.clone(),
        ));

        self.state().host = Some(Host {
            generation,
            process: launched.process,
            control: control.clone(),
            event_pump,
            event_listener: launched.event_listener,
        });

        tracing::debug!(plugin = %self.id, generation, pid, "Host launched, pinging");

        if let Err(e) = control.ping(self.ctx.settings.ping_timeout()).await {
            return Err(self.fail_start(format!("ping failed: {}", e)).await);
        }

        if !self.wait_for_host_registration(generation).await {
            self.ctx.metrics.record_registration_timeout();
            self.fail_start("host did not confirm its registration".to_string())
                .await;
            return Err(SupervisorError::HostRegistrationTimeout(self.id.clone()));
        }

        match control
            .get_capabilities(self.ctx.settings.capabilities_timeout())
            .await
        {
            Ok(capabilities) => {
                tracing::debug!(
                    plugin = %self.id,
                    count = capabilities.len(),
                    "Capabilities fetched"
                );
                self.capabilities.store(Arc::new(capabilities));
                self.state().capabilities_error = None;
            }
            Err(e) => {
                tracing::warn!(plugin = %self.id, "Failed to fetch capabilities: {}", e);
                self.capabilities.store(Arc::new(Vec::new()));
                self.state().capabilities_error = Some(e.to_string());
            }
        }

        self.state().crashed = false;
        self.set_status(RuntimeStatus::Loaded, None);
        tracing::info!(plugin = %self.id, generation, pid, "Plugin loaded");
        Ok(())
    }

    async fn fail_start(&self, reason: String) -> SupervisorError {
        tracing::error!(plugin = %self.id, "Plugin failed to start: {}", reason);
        self.teardown("host-start-failed").await;
        self.set_status(RuntimeStatus::Failed, Some(reason.clone()));
        SupervisorError::StartFailed {
            plugin: self.id.clone(),
            reason,
        }
    }

    async fn wait_for_host_registration(&self, generation: u64) -> bool {
        let deadline = Instant::now() + self.ctx.settings.registration_timeout();
        loop {
            {
                let state = self.state();
                if state.generation != generation || state.host.is_none() {
                    return false;
                }
                if state.host_registered {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.settings.registration_poll_interval()).await;
        }
    }

    /// End every session and stop the current host, if any.
    async fn teardown(&self, reason: &str) {
        let host = self.state().host.take();
        self.end_all_sessions(reason).await;
        if let Some(host) = host {
            self.stop_host(host, false).await;
        }
    }

    async fn stop_host(&self, host: Host, request_shutdown: bool) {
        let settings = &self.ctx.settings;

        if !host.process.has_exited() {
            if request_shutdown {
                if let Err(e) = host.control.shutdown(settings.best_effort_timeout()).await {
                    tracing::debug!(plugin = %self.id, "Shutdown request failed: {}", e);
                }
                if host.process.wait(settings.exit_wait()).await.is_none() {
                    tracing::warn!(
                        plugin = %self.id,
                        pid = host.process.id(),
                        "Host did not exit after shutdown request, terminating"
                    );
                }
            }
            if !host.process.has_exited() {
                host.process.terminate();
                let limit = settings.exit_wait() + settings.terminate_grace();
                if host.process.wait(limit).await.is_none() {
                    tracing::warn!(plugin = %self.id, pid = host.process.id(), "Host did not exit");
                }
            }
        }

        host.control.close().await;
        host.event_pump.abort();
        if let Some(listener) = host.event_listener {
            listener.stop(Duration::from_millis(200)).await;
        }
        tracing::debug!(plugin = %self.id, generation = host.generation, "Host stopped");
    }

    async fn on_process_exit(&self, generation: u64, exit: ProcessExit) {
        let host = {
            let mut state = self.state();
            let current = state
                .host
                .as_ref()
                .is_some_and(|h| h.generation == generation);
            if state.generation != generation || !current {
                return;
            }
            state.crashed = true;
            state.host.take()
        };
        let Some(host) = host else {
            return;
        };

        tracing::warn!(plugin = %self.id, generation, %exit, "Host process exited unexpectedly");

        self.end_all_sessions("host-exited").await;
        host.control.close().await;
        host.event_pump.abort();
        if let Some(listener) = host.event_listener {
            listener.stop(Duration::from_millis(200)).await;
        }

        self.set_status(
            RuntimeStatus::Failed,
            Some(format!("host process exited ({})", exit)),
        );
        self.schedule_restart(generation);
    }

    fn schedule_restart(&self, generation: u64) {
        if !self.config.restart_on_failure {
            return;
        }
        let attempt = {
            let state = self.state();
            if state.shutting_down {
                return;
            }
            if state.restart_count >= self.config.max_restarts {
                tracing::error!(
                    plugin = %self.id,
                    max_restarts = self.config.max_restarts,
                    "Plugin exceeded maximum restart attempts"
                );
                return;
            }
            state.restart_count
        };
        let Some(runtime) = self.weak.upgrade() else {
            return;
        };

        let delay = self.config.restart_delay(attempt);
        tracing::info!(plugin = %self.id, ?delay, "Scheduling host restart");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _lifecycle = runtime.lifecycle.lock().await;
            {
                let state = runtime.state();
                if state.shutting_down
                    || state.generation != generation
                    || state.status != RuntimeStatus::Failed
                {
                    return;
                }
            }
            runtime.count_restart();
            match runtime.start_locked().await {
                Ok(()) => tracing::info!(plugin = %runtime.id, "Plugin restarted after crash"),
                Err(e) => tracing::error!(plugin = %runtime.id, "Automatic restart failed: {}", e),
            }
        });
    }

    fn handle_host_event(&self, generation: u64, event: HostEvent) {
        match event {
            HostEvent::HostRegistered { token, process_id } => {
                let mut state = self.state();
                if state.generation != generation || state.token.as_deref() != Some(token.as_str()) {
                    tracing::debug!(plugin = %self.id, "Ignoring host registration with stale token");
                    return;
                }
                state.host_registered = true;
                state.host_process_id = Some(process_id);
                tracing::debug!(plugin = %self.id, generation, process_id, "Host registered");
            }
            HostEvent::SessionRegistered {
                token,
                process_id,
                session_id,
            } => {
                let identity_matches = {
                    let state = self.state();
                    state.token.as_deref() == Some(token.as_str())
                        && state.host_process_id.map_or(true, |pid| pid == process_id)
                };
                if !identity_matches {
                    tracing::warn!(
                        plugin = %self.id,
                        session_id = %session_id,
                        process_id,
                        "Ignoring session registration from another host generation"
                    );
                    return;
                }
                if self.sessions.accept_registration(&session_id) {
                    self.ctx.metrics.record_session_registered();
                    let _ = self.ctx.events.send(SupervisorEvent::SessionRegistered {
                        plugin_id: self.id.clone(),
                        session_id,
                    });
                } else {
                    tracing::debug!(
                        plugin = %self.id,
                        session_id = %session_id,
                        "Registration for a session that is not pending"
                    );
                }
            }
            HostEvent::UiStateInvalidated {
                capability_id,
                session_id,
                view_id,
                reason,
            } => {
                if self.state().generation != generation {
                    return;
                }
                let _ = self.ctx.events.send(SupervisorEvent::UiStateInvalidated {
                    plugin_id: self.id.clone(),
                    capability_id,
                    session_id,
                    view_id,
                    reason,
                });
            }
        }
    }

    /// Restart after a transient control failure and report whether it worked.
    async fn recover(&self, source: ControlError) -> SupervisorError {
        tracing::warn!(plugin = %self.id, error = %source, "Control call failed, restarting host");
        let recovered = match self.restart().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(plugin = %self.id, "Recovery restart failed: {}", e);
                false
            }
        };
        SupervisorError::CallFailed {
            plugin: self.id.clone(),
            source,
            recovered,
        }
    }

    /// Open a session on `capability_id` and return its id. When the
    /// capability needs a data plane, the session's segment is allocated,
    /// accepted by the host and being drained before this returns.
    pub async fn connect(
        &self,
        capability_id: &str,
        parameters: Value,
        shared_memory_hint: Option<u64>,
    ) -> Result<String> {
        let _gate = self.session_gate.lock().await;
        let control = self.loaded_control()?;

        let capability =
            self.capability(capability_id)
                .ok_or_else(|| SessionError::CapabilityNotFound {
                    plugin: self.id.clone(),
                    capability: capability_id.to_string(),
                })?;
        validate_parameters(&capability.parameter_schema, &parameters)
            .map_err(SessionError::InvalidParameters)?;
        if !capability.supports_multiple_sessions && self.sessions.open_for_capability(capability_id)
        {
            return Err(SessionError::ExclusiveSessionActive(capability_id.to_string()).into());
        }

        let session_id = Uuid::new_v4().to_string();
        let registered = self.sessions.begin_registration(&session_id, capability_id);
        self.ctx
            .session_owners
            .insert(session_id.clone(), self.id.clone());
        self.ctx.metrics.record_session_opened();
        let call_timeout = self.ctx.settings.call_timeout();

        match control
            .connect(capability_id, parameters, &session_id, call_timeout)
            .await
        {
            Ok(result) if result.session_id.as_deref() == Some(session_id.as_str()) => {}
            Ok(result) => {
                tracing::warn!(
                    plugin = %self.id,
                    expected = %session_id,
                    actual = ?result.session_id,
                    "Host answered connect with a different session id"
                );
                self.abort_session(&control, &session_id, "protocol-violation")
                    .await;
                return Err(SessionError::ProtocolViolation {
                    expected: session_id,
                    actual: result.session_id,
                }
                .into());
            }
            Err(e) => {
                self.end_session(&session_id, "connect-failed").await;
                if e.is_transient() {
                    return Err(self.recover(e).await);
                }
                return Err(SessionError::ConnectRejected(e.to_string()).into());
            }
        }

        let confirmed = matches!(
            tokio::time::timeout(self.ctx.settings.session_registration_timeout(), registered)
                .await,
            Ok(Ok(true))
        );
        if !confirmed {
            self.ctx.metrics.record_registration_timeout();
            self.abort_session(&control, &session_id, "session-registration-timeout")
                .await;
            return Err(SessionError::RegistrationTimeout(session_id).into());
        }

        if let Some(requirement) = capability.shared_memory.as_ref() {
            let hint = shared_memory_hint
                .or_else(|| self.config.shared_memory_hints.get(capability_id).copied());
            let requested = requirement.requested_bytes(hint);

            let descriptor = match self
                .ctx
                .segments
                .allocate_or_replace(&session_id, requested)
                .await
            {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    self.abort_session(&control, &session_id, "shared-memory-unavailable")
                        .await;
                    return Err(SessionError::Segment(e).into());
                }
            };
            self.sessions.add_resource(
                &session_id,
                SessionResource::SharedMemorySegment {
                    mapping_name: descriptor.mapping_name.clone(),
                },
            );
            let capacity = descriptor.capacity;

            let rejection: Option<SupervisorError> = match control
                .apply_shared_memory_segment(&session_id, descriptor, call_timeout)
                .await
            {
                Ok(result) if !result.accepted => {
                    Some(SessionError::SegmentRejected(session_id.clone()).into())
                }
                Ok(result) => {
                    let granted = result.granted_bytes.unwrap_or(capacity);
                    (granted < requirement.min_bytes).then(|| {
                        SessionError::InsufficientSegment {
                            granted,
                            minimum: requirement.min_bytes,
                        }
                        .into()
                    })
                }
                Err(e) if e.is_transient() => {
                    self.abort_session(&control, &session_id, "shared-memory-rejected")
                        .await;
                    return Err(self.recover(e).await);
                }
                Err(e) => Some(e.into()),
            };
            if let Some(error) = rejection {
                tracing::warn!(plugin = %self.id, session_id = %session_id, "Shared memory not accepted: {}", error);
                self.abort_session(&control, &session_id, "shared-memory-rejected")
                    .await;
                return Err(error);
            }

            if let Err(e) = self
                .ctx
                .segments
                .start_reading(&session_id, capability.data_format())
            {
                self.abort_session(&control, &session_id, "shared-memory-unavailable")
                    .await;
                return Err(SessionError::Segment(e).into());
            }
        }

        tracing::info!(
            plugin = %self.id,
            capability = %capability_id,
            session_id = %session_id,
            "Session connected"
        );
        Ok(session_id)
    }

    pub async fn disconnect(&self, session_id: &str, reason: Option<&str>) -> Result<()> {
        let _gate = self.session_gate.lock().await;
        if !self.sessions.is_open(session_id) {
            return Err(SessionError::UnknownSession(session_id.to_string()).into());
        }

        let outcome = match self.current_control() {
            Some(control) => {
                control
                    .disconnect(session_id, reason, self.ctx.settings.call_timeout())
                    .await
            }
            None => Ok(()),
        };
        self.end_session(session_id, reason.unwrap_or("disconnected"))
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(self.recover(e).await),
            Err(e) => {
                tracing::warn!(plugin = %self.id, session_id = %session_id, "Host rejected disconnect: {}", e);
                Ok(())
            }
        }
    }

    pub async fn get_ui_state(
        &self,
        capability_id: &str,
        session_id: Option<&str>,
        view_id: Option<&str>,
    ) -> Result<Value> {
        let control = self.loaded_control()?;
        match control
            .get_ui_state(
                capability_id,
                session_id,
                view_id,
                self.ctx.settings.call_timeout(),
            )
            .await
        {
            Ok(state) => Ok(state),
            Err(e) if e.is_transient() => Err(self.recover(e).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver a notification, restarting the host first if it crashed and
    /// afterwards if delivery failed.
    pub async fn notify(&self, notification: HostNotification) -> NotifyOutcome {
        let mut outcome = NotifyOutcome {
            plugin_id: self.id.clone(),
            error: None,
            restarted: false,
        };

        let host_alive = {
            let state = self.state();
            state.status == RuntimeStatus::Loaded
                && state.host.as_ref().is_some_and(|h| !h.process.has_exited())
        };
        if !host_alive {
            match self.restart().await {
                Ok(()) => outcome.restarted = true,
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            }
        }

        let control = match self.loaded_control() {
            Ok(control) => control,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        if let Err(e) = control
            .notify(notification, self.ctx.settings.call_timeout())
            .await
        {
            tracing::warn!(plugin = %self.id, "Notification failed, restarting host: {}", e);
            outcome.error = Some(e.to_string());
            match self.restart().await {
                Ok(()) => outcome.restarted = true,
                Err(err) => tracing::error!(plugin = %self.id, "Restart after notify failed: {}", err),
            }
        }
        outcome
    }

    /// Send a backpressure level to the host writing `session_id`. Returns
    /// `Ok(false)` when the session is not registered on a loaded runtime.
    pub async fn signal_backpressure(
        &self,
        session_id: &str,
        level: BackpressureLevel,
        timeout: Duration,
    ) -> Result<bool> {
        if self.status() != RuntimeStatus::Loaded || !self.sessions.is_registered(session_id) {
            return Ok(false);
        }
        let Some(control) = self.current_control() else {
            return Ok(false);
        };
        control.set_backpressure(session_id, level, timeout).await?;
        Ok(true)
    }

    /// Stop the host for good: end sessions, ask it to shut down, then terminate.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let host = {
            let mut state = self.state();
            state.shutting_down = true;
            state.host.take()
        };

        self.end_all_sessions("supervisor-shutdown").await;
        if let Some(host) = host {
            self.stop_host(host, true).await;
        }
        if self.status() == RuntimeStatus::Loaded {
            self.set_status(RuntimeStatus::Failed, None);
        }
        tracing::info!(plugin = %self.id, "Plugin runtime shut down");
    }

    async fn abort_session(&self, control: &ControlClient, session_id: &str, reason: &str) {
        if !control.is_closed() {
            if let Err(e) = control
                .disconnect(session_id, Some(reason), self.ctx.settings.best_effort_timeout())
                .await
            {
                tracing::debug!(plugin = %self.id, session_id = %session_id, "Rollback disconnect failed: {}", e);
            }
        }
        self.end_session(session_id, reason).await;
    }

    async fn end_session(&self, session_id: &str, reason: &str) {
        let ended = self.sessions.end_session(session_id);
        self.ctx.segments.cleanup(session_id).await;
        self.ctx.session_owners.remove(session_id);
        if let Some(ended) = ended {
            self.announce_ended(ended, reason);
        }
    }

    async fn end_all_sessions(&self, reason: &str) {
        for ended in self.sessions.fail_all() {
            self.ctx.segments.cleanup(&ended.session_id).await;
            self.ctx.session_owners.remove(&ended.session_id);
            self.announce_ended(ended, reason);
        }
    }

    fn announce_ended(&self, ended: EndedSession, reason: &str) {
        self.ctx.metrics.record_session_closed();
        tracing::debug!(
            plugin = %self.id,
            session_id = %ended.session_id,
            capability = %ended.capability_id,
            status = ?ended.status,
            resources = ended.resources.len(),
            reason,
            "Session ended"
        );
        let _ = self.ctx.events.send(SupervisorEvent::SessionEnded {
            plugin_id: self.id.clone(),
            session_id: ended.session_id,
            reason: reason.to_string(),
        });
    }
}

async fn pump_events(
    runtime: Weak<PluginRuntime>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        tracing::trace!(plugin = %runtime.id, event = event.name(), "Host event");
        runtime.handle_host_event(generation, event);
    }
}

async fn watch_exit(runtime: Weak<PluginRuntime>, generation: u64, process: ProcessHandle) {
    let exit = process.exited().await;
    if let Some(runtime) = runtime.upgrade() {
        runtime.on_process_exit(generation, exit).await;
    }
}

fn socket_tag(plugin_id: &str) -> String {
    plugin_id
        .chars()
        .take(SOCKET_TAG_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

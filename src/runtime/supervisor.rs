use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::launcher::HostLauncher;
use super::plugin::{NotifyOutcome, PluginRuntime, RuntimeContext, RuntimeSnapshot};
use super::SupervisorEvent;
use crate::backpressure::{BackpressureBridge, BackpressureTarget, BackpressureThresholds};
use crate::config::Config;
use crate::error::{Result, SessionError, SupervisorError};
use crate::metrics::Metrics;
use crate::protocol::{BackpressureLevel, HostNotification};
use crate::shm::{FrameReceiver, SegmentServiceOptions, SegmentSessionService};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const BRIDGE_STOP_TIMEOUT: Duration = Duration::from_secs(1);

type Runtimes = Arc<DashMap<String, Arc<PluginRuntime>>>;

/// Routes backpressure levels to whichever runtime owns the session.
struct BackpressureRouter {
    runtimes: Runtimes,
    session_owners: Arc<DashMap<String, String>>,
}

#[async_trait]
impl BackpressureTarget for BackpressureRouter {
    async fn signal_backpressure(
        &self,
        session_id: &str,
        level: BackpressureLevel,
        timeout: Duration,
    ) -> Result<bool> {
        let Some(owner) = self.session_owners.get(session_id).map(|o| o.value().clone()) else {
            return Ok(false);
        };
        let Some(runtime) = self.runtimes.get(&owner).map(|r| r.value().clone()) else {
            return Ok(false);
        };
        runtime.signal_backpressure(session_id, level, timeout).await
    }
}

/// Entry point for everything outside the runtimes: owns one
/// [`PluginRuntime`] per configured plugin, the shared segment service and the
/// backpressure bridge.
pub struct Supervisor {
    runtimes: Runtimes,
    segments: Arc<SegmentSessionService>,
    session_owners: Arc<DashMap<String, String>>,
    events: broadcast::Sender<SupervisorEvent>,
    metrics: Arc<Metrics>,
    router: Arc<BackpressureRouter>,
    bridge_cancel: CancellationToken,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build runtimes for every configured plugin. Nothing is launched until
    /// [`start_all`](Self::start_all) or [`start_plugin`](Self::start_plugin).
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        launcher: Arc<dyn HostLauncher>,
    ) -> Result<(Arc<Self>, FrameReceiver)> {
        let metrics = Arc::new(Metrics::new());
        let thresholds = BackpressureThresholds::from(&config.backpressure);
        let (pressure_tx, pressure_rx) = mpsc::unbounded_channel();

        let (segments, frames) = SegmentSessionService::new(
            SegmentServiceOptions::from_config(&config.shared_memory, thresholds),
            Some(pressure_tx),
            Some(metrics.clone()),
        )?;
        let segments = Arc::new(segments);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session_owners = Arc::new(DashMap::new());

        let ctx = RuntimeContext {
            launcher,
            segments: segments.clone(),
            settings: config.supervisor.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
            session_owners: session_owners.clone(),
        };

        let runtimes: Runtimes = Arc::new(DashMap::new());
        for (plugin_id, plugin_config) in config.plugins {
            let runtime = PluginRuntime::new(plugin_id.clone(), plugin_config, ctx.clone());
            runtimes.insert(plugin_id, runtime);
        }

        let router = Arc::new(BackpressureRouter {
            runtimes: runtimes.clone(),
            session_owners: session_owners.clone(),
        });
        let bridge_cancel = CancellationToken::new();
        let bridge = BackpressureBridge::new(router.clone(), config.backpressure.signal_timeout())
            .with_metrics(metrics.clone())
            .spawn(pressure_rx, bridge_cancel.clone());

        tracing::info!(plugins = runtimes.len(), "Supervisor created");

        let supervisor = Arc::new(Self {
            runtimes,
            segments,
            session_owners,
            events,
            metrics,
            router,
            bridge_cancel,
            bridge: Mutex::new(Some(bridge)),
        });
        Ok((supervisor, frames))
    }

    pub fn runtime(&self, plugin_id: &str) -> Result<Arc<PluginRuntime>> {
        self.runtimes
            .get(plugin_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| SupervisorError::PluginNotFound(plugin_id.to_string()))
    }

    fn all_runtimes(&self) -> Vec<Arc<PluginRuntime>> {
        let mut runtimes: Vec<Arc<PluginRuntime>> =
            self.runtimes.iter().map(|r| r.value().clone()).collect();
        runtimes.sort_by(|a, b| a.id().cmp(b.id()));
        runtimes
    }

    fn owner_of(&self, session_id: &str) -> Result<Arc<PluginRuntime>> {
        let owner = self
            .session_owners
            .get(session_id)
            .map(|o| o.value().clone())
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        self.runtime(&owner)
    }

    /// Start every enabled plugin concurrently. One plugin failing never
    /// prevents the others from loading.
    pub async fn start_all(&self) -> Vec<(String, Result<()>)> {
        let runtimes: Vec<Arc<PluginRuntime>> = self
            .all_runtimes()
            .into_iter()
            .filter(|r| r.config().enabled)
            .collect();

        let results = join_all(runtimes.iter().map(|runtime| runtime.start())).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for (runtime, result) in runtimes.iter().zip(results) {
            if let Err(e) = &result {
                tracing::error!(plugin = %runtime.id(), "Failed to start plugin: {}", e);
            }
            outcomes.push((runtime.id().to_string(), result));
        }
        outcomes
    }

    pub async fn start_plugin(&self, plugin_id: &str) -> Result<()> {
        self.runtime(plugin_id)?.start().await
    }

    pub async fn restart_plugin(&self, plugin_id: &str) -> Result<()> {
        self.runtime(plugin_id)?.restart().await
    }

    pub async fn connect(
        &self,
        plugin_id: &str,
        capability_id: &str,
        parameters: Value,
        shared_memory_hint: Option<u64>,
    ) -> Result<String> {
        self.runtime(plugin_id)?
            .connect(capability_id, parameters, shared_memory_hint)
            .await
    }

    pub async fn disconnect(&self, session_id: &str, reason: Option<&str>) -> Result<()> {
        self.owner_of(session_id)?
            .disconnect(session_id, reason)
            .await
    }

    pub async fn get_ui_state(
        &self,
        plugin_id: &str,
        capability_id: &str,
        session_id: Option<&str>,
        view_id: Option<&str>,
    ) -> Result<Value> {
        self.runtime(plugin_id)?
            .get_ui_state(capability_id, session_id, view_id)
            .await
    }

    /// Deliver a notification to every loaded or crashed runtime.
    pub async fn broadcast_notification(
        &self,
        notification: HostNotification,
    ) -> Vec<NotifyOutcome> {
        join_all(
            self.all_runtimes()
                .into_iter()
                .filter(|r| r.accepts_notifications())
                .map(|runtime| {
                    let notification = notification.clone();
                    async move { runtime.notify(notification).await }
                }),
        )
        .await
    }

    pub fn snapshots(&self) -> Vec<RuntimeSnapshot> {
        self.all_runtimes().iter().map(|r| r.snapshot()).collect()
    }

    pub fn snapshot(&self, plugin_id: &str) -> Result<RuntimeSnapshot> {
        Ok(self.runtime(plugin_id)?.snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn segments(&self) -> &Arc<SegmentSessionService> {
        &self.segments
    }

    pub fn owner_of_session(&self, session_id: &str) -> Option<String> {
        self.session_owners
            .get(session_id)
            .map(|o| o.value().clone())
    }

    /// Shut down every runtime, stop the backpressure bridge and release any
    /// segment still allocated.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down supervisor");
        join_all(self.all_runtimes().iter().map(|r| r.shutdown())).await;

        self.bridge_cancel.cancel();
        let bridge = self
            .bridge
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(bridge) = bridge {
            if tokio::time::timeout(BRIDGE_STOP_TIMEOUT, bridge).await.is_err() {
                tracing::warn!("Backpressure bridge did not stop in time");
            }
        }

        self.segments.release_all().await;
        tracing::info!("Supervisor shut down");
    }
}

#[async_trait]
impl BackpressureTarget for Supervisor {
    async fn signal_backpressure(
        &self,
        session_id: &str,
        level: BackpressureLevel,
        timeout: Duration,
    ) -> Result<bool> {
        self.router
            .signal_backpressure(session_id, level, timeout)
            .await
    }
}

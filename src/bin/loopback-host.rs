//! Demo plugin host. `loopback` streams numbered frames into the session's
//! shared memory ring; `console` is a single-session capability without a
//! data plane.

use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use plugin_supervisor::host::{
    self, ControlHandler, HandlerError, HandlerResult, HostArgs, HostContext,
};
use plugin_supervisor::protocol::{
    BackpressureLevel, CapabilityDescriptor, ControlRequest, HostNotification,
    SharedMemoryRequirement,
};
use plugin_supervisor::shm::{SegmentDescriptor, SharedMemorySegment};

const LOOPBACK: &str = "loopback";
const CONSOLE: &str = "console";

#[derive(Parser, Debug)]
#[command(name = "loopback-host")]
struct Args {
    #[command(flatten)]
    host: HostArgs,

    /// Delay between frames at no backpressure
    #[arg(long, default_value_t = 10)]
    frame_interval_ms: u64,
}

struct Stream {
    cancel: CancellationToken,
    interval_ms: Arc<AtomicU64>,
}

struct LoopbackHost {
    base_interval_ms: u64,
    streams: DashMap<String, Stream>,
    console_lines: DashMap<String, Vec<String>>,
}

impl LoopbackHost {
    fn new(base_interval_ms: u64) -> Self {
        Self {
            base_interval_ms: base_interval_ms.max(1),
            streams: DashMap::new(),
            console_lines: DashMap::new(),
        }
    }

    fn capabilities() -> Vec<CapabilityDescriptor> {
        vec![
            CapabilityDescriptor {
                id: LOOPBACK.to_string(),
                display_name: "Loopback stream".to_string(),
                parameter_schema: json!({
                    "type": "object",
                    "properties": { "label": { "type": "string" } }
                }),
                shared_memory: Some(SharedMemoryRequirement {
                    min_bytes: 4096,
                    preferred_bytes: Some(65536),
                }),
                supports_multiple_sessions: true,
                data_format: Some("text".to_string()),
            },
            CapabilityDescriptor {
                id: CONSOLE.to_string(),
                display_name: "Console".to_string(),
                parameter_schema: json!({ "type": "object" }),
                shared_memory: None,
                supports_multiple_sessions: false,
                data_format: None,
            },
        ]
    }

    fn start_stream(&self, session_id: &str, descriptor: &SegmentDescriptor) -> HandlerResult {
        let segment = SharedMemorySegment::open(descriptor)
            .map_err(|e| HandlerError::internal(format!("cannot open segment: {e}")))?;
        let cancel = CancellationToken::new();
        let interval_ms = Arc::new(AtomicU64::new(self.base_interval_ms));

        if let Some(previous) = self.streams.insert(
            session_id.to_string(),
            Stream {
                cancel: cancel.clone(),
                interval_ms: interval_ms.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut sequence: u64 = 0;
            loop {
                let delay = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                sequence += 1;
                let frame = format!("loopback {session} #{sequence}");
                match segment.try_write_frame(frame.as_bytes()) {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(session_id = %session, sequence, "Ring full, frame dropped"),
                    Err(e) => {
                        warn!(session_id = %session, "Stopping stream: {}", e);
                        break;
                    }
                }
            }
            debug!(session_id = %session, frames = sequence, "Stream stopped");
        });

        Ok(json!({ "accepted": true, "grantedBytes": descriptor.capacity }))
    }

    fn stop_stream(&self, session_id: &str) {
        if let Some((_, stream)) = self.streams.remove(session_id) {
            stream.cancel.cancel();
        }
    }

    fn apply_backpressure(&self, session_id: &str, level: BackpressureLevel) {
        let Some(stream) = self.streams.get(session_id) else {
            return;
        };
        let interval = match level {
            BackpressureLevel::High => stream.interval_ms.load(Ordering::Relaxed).saturating_mul(2),
            BackpressureLevel::Medium => stream.interval_ms.load(Ordering::Relaxed),
            BackpressureLevel::None => self.base_interval_ms,
        };
        stream.interval_ms.store(interval, Ordering::Relaxed);
        info!(session_id = %session_id, ?level, interval_ms = interval, "Backpressure applied");
    }
}

#[async_trait]
impl ControlHandler for LoopbackHost {
    async fn handle(&self, ctx: &HostContext, request: ControlRequest) -> HandlerResult {
        match request {
            ControlRequest::Ping => Ok(json!({})),
            ControlRequest::GetCapabilities => {
                Ok(json!({ "capabilities": Self::capabilities() }))
            }
            ControlRequest::Connect {
                capability_id,
                session_id,
                ..
            } => {
                if capability_id != LOOPBACK && capability_id != CONSOLE {
                    return Err(HandlerError::invalid_params(format!(
                        "unknown capability {capability_id}"
                    )));
                }
                if capability_id == CONSOLE {
                    self.console_lines.insert(session_id.clone(), Vec::new());
                }
                ctx.register_session(&session_id)
                    .await
                    .map_err(|e| HandlerError::internal(e.to_string()))?;
                Ok(json!({ "sessionId": session_id }))
            }
            ControlRequest::Disconnect { session_id, reason } => {
                info!(session_id = %session_id, ?reason, "Session closed");
                self.stop_stream(&session_id);
                self.console_lines.remove(&session_id);
                Ok(json!({}))
            }
            ControlRequest::GetUiState {
                capability_id,
                session_id,
                ..
            } => {
                let lines: Vec<String> = session_id
                    .as_deref()
                    .and_then(|id| self.console_lines.get(id).map(|l| l.value().clone()))
                    .unwrap_or_default();
                Ok(json!({
                    "capabilityId": capability_id,
                    "activeStreams": self.streams.len(),
                    "lines": lines,
                }))
            }
            ControlRequest::ApplySharedMemorySegment {
                session_id,
                descriptor,
            } => self.start_stream(&session_id, &descriptor),
            ControlRequest::SetBackpressure { session_id, level } => {
                self.apply_backpressure(&session_id, level);
                Ok(json!({}))
            }
            ControlRequest::Notify { notification } => {
                let line = match &notification {
                    HostNotification::LocaleChanged { locale } => format!("locale is now {locale}"),
                    HostNotification::SettingsChanged { .. } => "settings changed".to_string(),
                    HostNotification::Custom { name, .. } => format!("notification {name}"),
                };
                for mut entry in self.console_lines.iter_mut() {
                    entry.value_mut().push(line.clone());
                }
                let sessions: Vec<String> =
                    self.console_lines.iter().map(|e| e.key().clone()).collect();
                for session in sessions {
                    if let Err(e) = ctx
                        .invalidate_ui_state(CONSOLE, Some(&session), Some("notification"))
                        .await
                    {
                        warn!("Failed to publish ui invalidation: {}", e);
                    }
                }
                Ok(json!({}))
            }
            ControlRequest::Shutdown => {
                for entry in self.streams.iter() {
                    entry.value().cancel.cancel();
                }
                Ok(json!({}))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ctx = HostContext::connect(&args.host).await?;
    info!(plugin = %ctx.plugin_id(), pid = ctx.process_id(), "Loopback host starting");

    host::serve_stdio(Arc::new(LoopbackHost::new(args.frame_interval_ms)), ctx).await?;
    info!("Loopback host exiting");
    Ok(())
}

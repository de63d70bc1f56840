use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ControlError;
use crate::metrics::{CallTimer, Metrics};
use crate::protocol::{
    ApplySegmentResult, BackpressureLevel, CapabilitiesResult, CapabilityDescriptor,
    ConnectResult, ControlRequest, HostNotification, JsonRpcId, JsonRpcMessage, JsonRpcResponse,
    JsonRpcV2Message,
};
use crate::shm::SegmentDescriptor;
use crate::transport::Connection;

type Pending = DashMap<i64, oneshot::Sender<JsonRpcResponse>>;

/// Request/response client for one host process's control channel.
///
/// Responses are matched to calls by id, so calls may overlap. Every call has
/// its own deadline; when the channel dies all outstanding calls fail with
/// [`ControlError::Closed`] immediately.
pub struct ControlClient {
    plugin_id: String,
    connection: Arc<dyn Connection>,
    pending: Arc<Pending>,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl ControlClient {
    pub fn new(
        plugin_id: impl Into<String>,
        connection: Arc<dyn Connection>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let plugin_id = plugin_id.into();
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(read_responses(
            plugin_id.clone(),
            connection.clone(),
            pending.clone(),
            closed.clone(),
            cancel.clone(),
        ));

        Self {
            plugin_id,
            connection,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            cancel,
            metrics,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn call(&self, request: ControlRequest, timeout: Duration) -> Result<Value, ControlError> {
        let timer = self.metrics.clone().map(CallTimer::new);
        let result = self.call_inner(&request, timeout).await;
        if let Some(timer) = timer {
            if result.is_ok() {
                timer.finish();
            } else {
                timer.fail();
            }
        }
        if let Err(e) = &result {
            tracing::debug!(
                plugin = %self.plugin_id,
                method = request.method_name(),
                error = %e,
                "Control call failed"
            );
        }
        result
    }

    async fn call_inner(&self, request: &ControlRequest, timeout: Duration) -> Result<Value, ControlError> {
        let method = request.method_name();
        if self.is_closed() {
            return Err(ControlError::Closed);
        }

        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = request
            .to_jsonrpc(JsonRpcId::Number(id))
            .and_then(|rpc| JsonRpcMessage::request(rpc).to_line())
            .map_err(|e| ControlError::Send {
                method,
                reason: e.to_string(),
            })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // The reader may have drained `pending` between the check above and the insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(ControlError::Closed);
        }

        let timeout_error = || ControlError::Timeout {
            method,
            timeout_ms: timeout.as_millis() as u64,
        };

        match tokio::time::timeout(timeout, self.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                self.pending.remove(&id);
                if self.is_closed() {
                    return Err(ControlError::Closed);
                }
                return Err(ControlError::Send { method, reason });
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(timeout_error());
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    return Err(ControlError::Remote {
                        code: error.code,
                        message: error.message,
                    });
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(timeout_error())
            }
        }
    }

    async fn send(&self, line: Bytes) -> Result<(), String> {
        self.connection.send(line).await.map_err(|e| e.to_string())
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<T, ControlError> {
        let method = request.method_name();
        let value = self.call(request, timeout).await?;
        serde_json::from_value(value).map_err(|e| ControlError::Malformed {
            method,
            reason: e.to_string(),
        })
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), ControlError> {
        self.call(ControlRequest::Ping, timeout).await.map(|_| ())
    }

    pub async fn get_capabilities(
        &self,
        timeout: Duration,
    ) -> Result<Vec<CapabilityDescriptor>, ControlError> {
        let result: CapabilitiesResult = self
            .call_typed(ControlRequest::GetCapabilities, timeout)
            .await?;
        Ok(result.capabilities)
    }

    pub async fn connect(
        &self,
        capability_id: &str,
        parameters: Value,
        session_id: &str,
        timeout: Duration,
    ) -> Result<ConnectResult, ControlError> {
        self.call_typed(
            ControlRequest::Connect {
                capability_id: capability_id.to_string(),
                parameters,
                session_id: session_id.to_string(),
            },
            timeout,
        )
        .await
    }

    pub async fn disconnect(
        &self,
        session_id: &str,
        reason: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        self.call(
            ControlRequest::Disconnect {
                session_id: session_id.to_string(),
                reason: reason.map(str::to_string),
            },
            timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn get_ui_state(
        &self,
        capability_id: &str,
        session_id: Option<&str>,
        view_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.call(
            ControlRequest::GetUiState {
                capability_id: capability_id.to_string(),
                session_id: session_id.map(str::to_string),
                view_id: view_id.map(str::to_string),
            },
            timeout,
        )
        .await
    }

    pub async fn apply_shared_memory_segment(
        &self,
        session_id: &str,
        descriptor: SegmentDescriptor,
        timeout: Duration,
    ) -> Result<ApplySegmentResult, ControlError> {
        self.call_typed(
            ControlRequest::ApplySharedMemorySegment {
                session_id: session_id.to_string(),
                descriptor,
            },
            timeout,
        )
        .await
    }

    pub async fn set_backpressure(
        &self,
        session_id: &str,
        level: BackpressureLevel,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        self.call(
            ControlRequest::SetBackpressure {
                session_id: session_id.to_string(),
                level,
            },
            timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn notify(
        &self,
        notification: HostNotification,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        self.call(ControlRequest::Notify { notification }, timeout)
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ControlError> {
        self.call(ControlRequest::Shutdown, timeout).await.map(|_| ())
    }

    /// Stop the response reader and fail every outstanding call.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.pending.clear();
        if let Err(e) = self.connection.close().await {
            tracing::debug!(plugin = %self.plugin_id, "Failed to close control channel: {}", e);
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_responses(
    plugin_id: String,
    connection: Arc<dyn Connection>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = connection.recv() => received,
        };

        let data = match received {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(plugin = %plugin_id, "Control channel closed: {}", e);
                break;
            }
        };

        match serde_json::from_slice::<JsonRpcMessage>(&data) {
            Ok(JsonRpcMessage::V2(JsonRpcV2Message::Response(response))) => {
                let JsonRpcId::Number(id) = response.id else {
                    tracing::warn!(plugin = %plugin_id, "Response with non-numeric id ignored");
                    continue;
                };
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(plugin = %plugin_id, id, "Late or unknown response dropped");
                    }
                }
            }
            Ok(_) => {
                tracing::debug!(plugin = %plugin_id, "Ignoring unsolicited message from host");
            }
            Err(e) => {
                tracing::warn!(plugin = %plugin_id, "Malformed control message: {}", e);
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.clear();
}

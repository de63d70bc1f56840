//! Fill-level classification and the bridge that pushes backpressure levels
//! back to the host writing into a session's ring.
//!
//! The bridge never blocks the producer of pressure signals: each signal is
//! forwarded from a detached task with a short timeout and failures are only
//! logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BackpressureConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::protocol::BackpressureLevel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackpressureThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            medium: 0.5,
            high: 0.85,
        }
    }
}

impl From<&BackpressureConfig> for BackpressureThresholds {
    fn from(config: &BackpressureConfig) -> Self {
        Self {
            medium: config.medium_threshold,
            high: config.high_threshold,
        }
    }
}

impl BackpressureThresholds {
    pub fn classify(&self, used: u64, capacity: u64) -> BackpressureLevel {
        if capacity == 0 {
            return BackpressureLevel::None;
        }
        let ratio = used as f64 / capacity as f64;
        if ratio >= self.high {
            BackpressureLevel::High
        } else if ratio >= self.medium {
            BackpressureLevel::Medium
        } else {
            BackpressureLevel::None
        }
    }
}

/// "Pressure detected" observation for one session's segment.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureSignal {
    pub session_id: String,
    pub level: BackpressureLevel,
    pub fill_ratio: f64,
}

/// Whoever can route a level to the host owning a session.
#[async_trait]
pub trait BackpressureTarget: Send + Sync + 'static {
    /// Send `level` to the session's host. Returns `Ok(false)` when the
    /// session is not registered on a loaded runtime and nothing was sent.
    async fn signal_backpressure(
        &self,
        session_id: &str,
        level: BackpressureLevel,
        timeout: Duration,
    ) -> Result<bool>;
}

pub struct BackpressureBridge {
    target: Arc<dyn BackpressureTarget>,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl BackpressureBridge {
    pub fn new(target: Arc<dyn BackpressureTarget>, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Forward one signal from a detached task.
    pub fn dispatch(&self, signal: PressureSignal) -> JoinHandle<()> {
        let target = self.target.clone();
        let timeout = self.timeout;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            tracing::debug!(
                session_id = %signal.session_id,
                level = ?signal.level,
                fill_ratio = signal.fill_ratio,
                "Backpressure level changed"
            );

            match target
                .signal_backpressure(&signal.session_id, signal.level, timeout)
                .await
            {
                Ok(true) => {
                    if let Some(metrics) = &metrics {
                        metrics.record_backpressure_signal(true);
                    }
                }
                Ok(false) => {
                    tracing::trace!(
                        session_id = %signal.session_id,
                        "Session not registered, backpressure signal skipped"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %signal.session_id,
                        level = ?signal.level,
                        error = %e,
                        "Failed to deliver backpressure signal"
                    );
                    if let Some(metrics) = &metrics {
                        metrics.record_backpressure_signal(false);
                    }
                }
            }
        })
    }

    /// Consume signals until cancelled or every sender is gone.
    pub fn spawn(
        self,
        mut signals: mpsc::UnboundedReceiver<PressureSignal>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => {
                            self.dispatch(signal);
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!("Backpressure bridge stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ControlError, SupervisorError};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        registered: Vec<String>,
        fail: bool,
        sent: Mutex<Vec<(String, BackpressureLevel)>>,
    }

    #[async_trait]
    impl BackpressureTarget for RecordingTarget {
        async fn signal_backpressure(
            &self,
            session_id: &str,
            level: BackpressureLevel,
            _timeout: Duration,
        ) -> Result<bool> {
            if !self.registered.iter().any(|s| s == session_id) {
                return Ok(false);
            }
            if self.fail {
                return Err(SupervisorError::Control(ControlError::Closed));
            }
            self.sent
                .lock()
                .unwrap()
                .push((session_id.to_string(), level));
            Ok(true)
        }
    }

    fn signal(session_id: &str, level: BackpressureLevel) -> PressureSignal {
        PressureSignal {
            session_id: session_id.to_string(),
            level,
            fill_ratio: 0.9,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let thresholds = BackpressureThresholds::default();
        assert_eq!(thresholds.classify(0, 100), BackpressureLevel::None);
        assert_eq!(thresholds.classify(49, 100), BackpressureLevel::None);
        assert_eq!(thresholds.classify(50, 100), BackpressureLevel::Medium);
        assert_eq!(thresholds.classify(84, 100), BackpressureLevel::Medium);
        assert_eq!(thresholds.classify(85, 100), BackpressureLevel::High);
        assert_eq!(thresholds.classify(10, 0), BackpressureLevel::None);
    }

    #[tokio::test]
    async fn test_only_registered_sessions_are_signalled() {
        let target = Arc::new(RecordingTarget {
            registered: vec!["live".to_string()],
            ..Default::default()
        });
        let bridge = BackpressureBridge::new(target.clone(), Duration::from_millis(150));

        bridge
            .dispatch(signal("live", BackpressureLevel::High))
            .await
            .unwrap();
        bridge
            .dispatch(signal("stale", BackpressureLevel::High))
            .await
            .unwrap();

        let sent = target.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("live".to_string(), BackpressureLevel::High)]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let target = Arc::new(RecordingTarget {
            registered: vec!["live".to_string()],
            fail: true,
            ..Default::default()
        });
        let metrics = Arc::new(Metrics::new());
        let bridge = BackpressureBridge::new(target, Duration::from_millis(150))
            .with_metrics(metrics.clone());

        // The detached task completes normally even though delivery failed.
        tokio_test::assert_ok!(bridge.dispatch(signal("live", BackpressureLevel::Medium)).await);
        assert_eq!(metrics.backpressure_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_bridge_task_stops_on_cancel() {
        let target = Arc::new(RecordingTarget::default());
        let bridge = BackpressureBridge::new(target, Duration::from_millis(150));
        let (_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = bridge.spawn(rx, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

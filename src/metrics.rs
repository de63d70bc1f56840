use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Metrics {
    registry: Registry,

    // Runtime metrics
    pub loaded_runtimes: IntGauge,
    pub failed_runtimes: IntGauge,
    pub runtime_restarts: IntCounter,

    // Session metrics
    pub open_sessions: IntGauge,
    pub session_registrations: IntCounter,
    pub registration_timeouts: IntCounter,

    // Control channel metrics
    pub control_calls_total: IntCounter,
    pub control_calls_failed: IntCounter,
    pub control_call_duration: Histogram,

    // Data plane metrics
    pub frames_ingested: IntCounter,
    pub bytes_ingested: IntCounter,
    pub corrupt_frames: IntCounter,

    // Backpressure metrics
    pub backpressure_signals: IntCounter,
    pub backpressure_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("metric creation failed")
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let loaded_runtimes = gauge(
            "plugin_supervisor_loaded_runtimes",
            "Number of plugin runtimes currently loaded",
        );
        let failed_runtimes = gauge(
            "plugin_supervisor_failed_runtimes",
            "Number of plugin runtimes currently failed",
        );
        let runtime_restarts = counter(
            "plugin_supervisor_runtime_restarts_total",
            "Total number of host process restarts",
        );

        let open_sessions = gauge(
            "plugin_supervisor_open_sessions",
            "Number of open capability sessions",
        );
        let session_registrations = counter(
            "plugin_supervisor_session_registrations_total",
            "Total number of sessions confirmed by a host",
        );
        let registration_timeouts = counter(
            "plugin_supervisor_registration_timeouts_total",
            "Total number of host or session registration timeouts",
        );

        let control_calls_total = counter(
            "plugin_supervisor_control_calls_total",
            "Total number of control channel calls",
        );
        let control_calls_failed = counter(
            "plugin_supervisor_control_calls_failed",
            "Total number of failed control channel calls",
        );
        let control_call_duration = Histogram::with_opts(HistogramOpts::new(
            "plugin_supervisor_control_call_duration_seconds",
            "Control channel call duration in seconds",
        ))
        .expect("metric creation failed");

        let frames_ingested = counter(
            "plugin_supervisor_frames_ingested_total",
            "Total number of frames drained from shared memory",
        );
        let bytes_ingested = counter(
            "plugin_supervisor_bytes_ingested_total",
            "Total payload bytes drained from shared memory",
        );
        let corrupt_frames = counter(
            "plugin_supervisor_corrupt_frames_total",
            "Total number of corrupted frame prefixes recovered from",
        );

        let backpressure_signals = counter(
            "plugin_supervisor_backpressure_signals_total",
            "Total number of backpressure levels delivered to hosts",
        );
        let backpressure_failures = counter(
            "plugin_supervisor_backpressure_failures_total",
            "Total number of backpressure levels that could not be delivered",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(loaded_runtimes.clone()),
            Box::new(failed_runtimes.clone()),
            Box::new(runtime_restarts.clone()),
            Box::new(open_sessions.clone()),
            Box::new(session_registrations.clone()),
            Box::new(registration_timeouts.clone()),
            Box::new(control_calls_total.clone()),
            Box::new(control_calls_failed.clone()),
            Box::new(control_call_duration.clone()),
            Box::new(frames_ingested.clone()),
            Box::new(bytes_ingested.clone()),
            Box::new(corrupt_frames.clone()),
            Box::new(backpressure_signals.clone()),
            Box::new(backpressure_failures.clone()),
        ];
        for collector in collectors {
            if let Err(e) = registry.register(collector) {
                tracing::warn!("Failed to register metric: {}", e);
            }
        }

        Self {
            registry,
            loaded_runtimes,
            failed_runtimes,
            runtime_restarts,
            open_sessions,
            session_registrations,
            registration_timeouts,
            control_calls_total,
            control_calls_failed,
            control_call_duration,
            frames_ingested,
            bytes_ingested,
            corrupt_frames,
            backpressure_signals,
            backpressure_failures,
        }
    }

    pub fn record_runtime_loaded(&self) {
        self.loaded_runtimes.inc();
    }

    pub fn record_runtime_unloaded(&self) {
        self.loaded_runtimes.dec();
    }

    pub fn record_runtime_failed(&self) {
        self.failed_runtimes.inc();
    }

    pub fn record_runtime_recovered(&self) {
        self.failed_runtimes.dec();
    }

    pub fn record_restart(&self) {
        self.runtime_restarts.inc();
    }

    pub fn record_session_opened(&self) {
        self.open_sessions.inc();
    }

    pub fn record_session_closed(&self) {
        self.open_sessions.dec();
    }

    pub fn record_session_registered(&self) {
        self.session_registrations.inc();
    }

    pub fn record_registration_timeout(&self) {
        self.registration_timeouts.inc();
    }

    pub fn record_control_call(&self, duration: Duration, success: bool) {
        self.control_calls_total.inc();
        self.control_call_duration.observe(duration.as_secs_f64());
        if !success {
            self.control_calls_failed.inc();
        }
    }

    pub fn record_frame_ingested(&self, bytes: usize) {
        self.frames_ingested.inc();
        self.bytes_ingested.inc_by(bytes as u64);
    }

    pub fn record_corrupt_frames(&self, count: u64) {
        self.corrupt_frames.inc_by(count);
    }

    pub fn record_backpressure_signal(&self, delivered: bool) {
        if delivered {
            self.backpressure_signals.inc();
        } else {
            self.backpressure_failures.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Measures one control call; dropping it without `finish`/`fail` records nothing.
pub struct CallTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl CallTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        self.metrics.record_control_call(self.start.elapsed(), true);
    }

    pub fn fail(self) {
        self.metrics.record_control_call(self.start.elapsed(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_frame_ingested(10);
        metrics.record_frame_ingested(6);
        metrics.record_corrupt_frames(2);
        metrics.record_backpressure_signal(true);
        CallTimer::new(metrics.clone()).fail();

        assert_eq!(metrics.frames_ingested.get(), 2);
        assert_eq!(metrics.bytes_ingested.get(), 16);
        assert_eq!(metrics.corrupt_frames.get(), 2);
        assert_eq!(metrics.control_calls_failed.get(), 1);

        let text = metrics.encode_text();
        assert!(text.contains("plugin_supervisor_frames_ingested_total 2"));
        assert!(text.contains("plugin_supervisor_backpressure_signals_total 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.record_session_opened();
        assert_eq!(a.open_sessions.get(), 1);
        assert_eq!(b.open_sessions.get(), 0);
    }
}

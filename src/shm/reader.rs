//! Per-session ingest loop draining a segment into the frame queue.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::segment::SharedMemorySegment;
use crate::backpressure::{BackpressureThresholds, PressureSignal};
use crate::metrics::Metrics;
use crate::protocol::BackpressureLevel;

/// Frames drained per wake-up before yielding to other tasks.
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameDirection {
    HostToSupervisor,
}

/// One payload taken out of a session's ring, handed to downstream consumers.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub session_id: String,
    /// Monotonically increasing per session, starting at 1.
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: FrameDirection,
    pub payload: Bytes,
    /// Format declared by the capability, e.g. `binary` or `text`.
    pub format: String,
}

pub type FrameSender = mpsc::UnboundedSender<FrameRecord>;
pub type FrameReceiver = mpsc::UnboundedReceiver<FrameRecord>;
pub type PressureSender = mpsc::UnboundedSender<PressureSignal>;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub poll_interval: Duration,
    pub thresholds: BackpressureThresholds,
    pub format: String,
}

/// Everything a reader needs besides the segment itself.
#[derive(Clone)]
pub struct ReaderSinks {
    pub frames: FrameSender,
    pub pressure: Option<PressureSender>,
    pub metrics: Option<Arc<Metrics>>,
}

pub struct SegmentReader {
    session_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SegmentReader {
    pub fn spawn(
        session_id: String,
        segment: Arc<SharedMemorySegment>,
        frame_ids: Arc<AtomicU64>,
        sinks: ReaderSinks,
        options: ReaderOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            session_id.clone(),
            segment,
            frame_ids,
            sinks,
            options,
            cancel.clone(),
        ));

        tracing::debug!(session_id = %session_id, "Shared memory reader started");

        Self {
            session_id,
            cancel,
            handle,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait up to `timeout` for it to observe the
    /// cancellation. Returns false if the task had to be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(_) => {
                tracing::debug!(session_id = %self.session_id, "Shared memory reader stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Shared memory reader did not stop in time, aborting"
                );
                abort.abort();
                false
            }
        }
    }
}

async fn run(
    session_id: String,
    segment: Arc<SharedMemorySegment>,
    frame_ids: Arc<AtomicU64>,
    sinks: ReaderSinks,
    options: ReaderOptions,
    cancel: CancellationToken,
) {
    let mut level = BackpressureLevel::None;
    let mut corrupt_seen = segment.corrupt_frames();

    while !cancel.is_cancelled() {
        let stats = segment.statistics();
        let observed = options.thresholds.classify(stats.used, stats.capacity);
        if observed != level {
            level = observed;
            if let Some(pressure) = &sinks.pressure {
                let _ = pressure.send(PressureSignal {
                    session_id: session_id.clone(),
                    level,
                    fill_ratio: stats.fill_ratio(),
                });
            }
        }

        let mut drained = 0;
        while drained < MAX_BATCH {
            let Some(payload) = segment.try_read_frame() else {
                break;
            };
            drained += 1;

            if let Some(metrics) = &sinks.metrics {
                metrics.record_frame_ingested(payload.len());
            }

            let record = FrameRecord {
                session_id: session_id.clone(),
                frame_id: frame_ids.fetch_add(1, Ordering::Relaxed) + 1,
                timestamp: Utc::now(),
                direction: FrameDirection::HostToSupervisor,
                payload: Bytes::from(payload),
                format: options.format.clone(),
            };
            if sinks.frames.send(record).is_err() {
                tracing::debug!(session_id = %session_id, "Frame consumer gone, reader exiting");
                return;
            }
        }

        let corrupt = segment.corrupt_frames();
        if corrupt != corrupt_seen {
            if let Some(metrics) = &sinks.metrics {
                metrics.record_corrupt_frames(corrupt - corrupt_seen);
            }
            corrupt_seen = corrupt;
        }

        if drained == 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(options.poll_interval) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> ReaderOptions {
        ReaderOptions {
            poll_interval: Duration::from_millis(1),
            thresholds: BackpressureThresholds::default(),
            format: "binary".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reader_delivers_frames_in_write_order() {
        let dir = TempDir::new().unwrap();
        let segment = Arc::new(
            SharedMemorySegment::create(&dir.path().join("r.shm"), "s-1", 4096).unwrap(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = SegmentReader::spawn(
            "s-1".to_string(),
            segment.clone(),
            Arc::new(AtomicU64::new(0)),
            ReaderSinks {
                frames: tx,
                pressure: None,
                metrics: None,
            },
            options(),
        );

        for i in 0..50u32 {
            while segment.try_write_frame(&i.to_le_bytes()).unwrap().is_none() {
                tokio::task::yield_now().await;
            }
        }

        for i in 0..50u32 {
            let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.frame_id, u64::from(i) + 1);
            assert_eq!(record.payload.as_ref(), &i.to_le_bytes());
            assert_eq!(record.session_id, "s-1");
            assert_eq!(record.direction, FrameDirection::HostToSupervisor);
        }

        assert!(reader.stop(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_reader_reports_pressure_changes() {
        let dir = TempDir::new().unwrap();
        let segment = Arc::new(
            SharedMemorySegment::create(&dir.path().join("p.shm"), "s-2", 1024).unwrap(),
        );
        // Fill to ~90% before the reader first looks.
        for _ in 0..3 {
            segment.try_write_frame(&[0u8; 300]).unwrap().unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ptx, mut prx) = mpsc::unbounded_channel();
        let reader = SegmentReader::spawn(
            "s-2".to_string(),
            segment.clone(),
            Arc::new(AtomicU64::new(0)),
            ReaderSinks {
                frames: tx,
                pressure: Some(ptx),
                metrics: None,
            },
            options(),
        );

        let first = tokio::time::timeout(Duration::from_secs(2), prx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.level, BackpressureLevel::High);
        assert_eq!(first.session_id, "s-2");

        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        let relieved = tokio::time::timeout(Duration::from_secs(2), prx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relieved.level, BackpressureLevel::None);

        assert!(reader.stop(Duration::from_millis(500)).await);
    }
}

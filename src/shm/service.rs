use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::descriptor::SegmentDescriptor;
use super::reader::{FrameReceiver, PressureSender, ReaderOptions, ReaderSinks, SegmentReader};
use super::segment::{SharedMemorySegment, MAX_CAPACITY};
use crate::backpressure::BackpressureThresholds;
use crate::config::SharedMemoryConfig;
use crate::error::SegmentError;
use crate::metrics::Metrics;

/// Longest session id fragment embedded in a backing file name.
const FILE_TAG_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct SegmentServiceOptions {
    pub directory: PathBuf,
    pub page_size: u64,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub thresholds: BackpressureThresholds,
}

impl Default for SegmentServiceOptions {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("plugin-supervisor").join("segments"),
            page_size: 4096,
            poll_interval: Duration::from_millis(2),
            stop_timeout: Duration::from_millis(500),
            thresholds: BackpressureThresholds::default(),
        }
    }
}

impl SegmentServiceOptions {
    pub fn from_config(config: &SharedMemoryConfig, thresholds: BackpressureThresholds) -> Self {
        Self {
            directory: config.segment_directory(),
            page_size: config.page_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stop_timeout: Duration::from_millis(config.reader_stop_timeout_ms),
            thresholds,
        }
    }
}

struct SessionSegment {
    segment: Arc<SharedMemorySegment>,
    reader: Option<SegmentReader>,
}

/// Owns every session's segment and ingest reader.
///
/// Other components only ever borrow segments through [`segment`](Self::segment).
pub struct SegmentSessionService {
    options: SegmentServiceOptions,
    sessions: DashMap<String, SessionSegment>,
    frame_ids: DashMap<String, Arc<AtomicU64>>,
    sinks: ReaderSinks,
}

impl SegmentSessionService {
    pub fn new(
        options: SegmentServiceOptions,
        pressure: Option<PressureSender>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<(Self, FrameReceiver), SegmentError> {
        if options.page_size == 0 {
            return Err(SegmentError::InvalidSize(0));
        }
        std::fs::create_dir_all(&options.directory)?;

        let (frames, receiver) = mpsc::unbounded_channel();
        let service = Self {
            options,
            sessions: DashMap::new(),
            frame_ids: DashMap::new(),
            sinks: ReaderSinks {
                frames,
                pressure,
                metrics,
            },
        };
        Ok((service, receiver))
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.options.directory
    }

    /// Allocate a fresh segment for `session_id`, releasing any previous one
    /// first. The ingest reader is not started.
    pub async fn allocate_or_replace(
        &self,
        session_id: &str,
        requested_bytes: u64,
    ) -> Result<SegmentDescriptor, SegmentError> {
        if session_id.is_empty() {
            return Err(SegmentError::EmptySessionId);
        }
        if requested_bytes == 0 {
            return Err(SegmentError::InvalidSize(0));
        }

        self.release(session_id).await;

        let page = self.options.page_size;
        let capacity = requested_bytes
            .div_ceil(page)
            .checked_mul(page)
            .filter(|&c| c <= MAX_CAPACITY as u64)
            .ok_or(SegmentError::InvalidSize(requested_bytes))?;

        let path = self.options.directory.join(format!(
            "seg-{}-{}.shm",
            file_tag(session_id),
            uuid::Uuid::new_v4().simple()
        ));
        let segment = SharedMemorySegment::create(&path, session_id, capacity as usize)?;
        let descriptor = segment.descriptor();

        tracing::debug!(
            session_id = %session_id,
            requested_bytes,
            capacity,
            path = %path.display(),
            "Allocated shared memory segment"
        );

        self.sessions.insert(
            session_id.to_string(),
            SessionSegment {
                segment: Arc::new(segment),
                reader: None,
            },
        );
        Ok(descriptor)
    }

    /// Start draining the session's segment. Calling it again while the
    /// reader runs is a no-op.
    pub fn start_reading(&self, session_id: &str, format: &str) -> Result<(), SegmentError> {
        let frame_ids = self
            .frame_ids
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();

        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SegmentError::UnknownSession(session_id.to_string()))?;

        if entry.reader.as_ref().is_some_and(|r| !r.is_finished()) {
            return Ok(());
        }

        let reader = SegmentReader::spawn(
            session_id.to_string(),
            entry.segment.clone(),
            frame_ids,
            self.sinks.clone(),
            ReaderOptions {
                poll_interval: self.options.poll_interval,
                thresholds: self.options.thresholds,
                format: format.to_string(),
            },
        );
        entry.reader = Some(reader);
        Ok(())
    }

    /// Stop the reader and delete the backing file. Unknown sessions are ignored.
    pub async fn release(&self, session_id: &str) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return;
        };

        if let Some(reader) = entry.reader {
            reader.stop(self.options.stop_timeout).await;
        }

        let path = entry.segment.path().to_path_buf();
        drop(entry.segment);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    "Failed to remove segment file: {}",
                    e
                );
            }
        }

        tracing::debug!(session_id = %session_id, "Released shared memory segment");
    }

    /// Release the segment and forget the session's frame numbering.
    pub async fn cleanup(&self, session_id: &str) {
        self.release(session_id).await;
        self.frame_ids.remove(session_id);
    }

    pub async fn release_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cleanup(&id).await;
        }
        self.frame_ids.clear();
    }

    pub fn segment(&self, session_id: &str) -> Option<Arc<SharedMemorySegment>> {
        self.sessions.get(session_id).map(|e| e.segment.clone())
    }

    pub fn is_reading(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|e| e.reader.as_ref().is_some_and(|r| !r.is_finished()))
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

fn file_tag(session_id: &str) -> String {
    session_id
        .chars()
        .take(FILE_TAG_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (SegmentSessionService, FrameReceiver) {
        let options = SegmentServiceOptions {
            directory: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        };
        SegmentSessionService::new(options, None, None).unwrap()
    }

    #[tokio::test]
    async fn test_allocation_rounds_up_to_page_size() {
        let dir = TempDir::new().unwrap();
        let (service, _frames) = service(&dir);

        let descriptor = service.allocate_or_replace("s-1", 1000).await.unwrap();
        assert_eq!(descriptor.capacity, 4096);
        assert!(std::path::Path::new(&descriptor.mapping_name).exists());
        assert!(!service.is_reading("s-1"));

        let exact = service.allocate_or_replace("s-2", 8192).await.unwrap();
        assert_eq!(exact.capacity, 8192);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (service, _frames) = service(&dir);

        assert!(matches!(
            service.allocate_or_replace("", 4096).await,
            Err(SegmentError::EmptySessionId)
        ));
        assert!(matches!(
            service.allocate_or_replace("s", 0).await,
            Err(SegmentError::InvalidSize(0))
        ));
        assert!(matches!(
            service.start_reading("nobody", "binary"),
            Err(SegmentError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_releases_previous_segment() {
        let dir = TempDir::new().unwrap();
        let (service, _frames) = service(&dir);

        let first = service.allocate_or_replace("s", 4096).await.unwrap();
        service.start_reading("s", "binary").unwrap();
        let second = service.allocate_or_replace("s", 2048).await.unwrap();

        assert_ne!(first.mapping_name, second.mapping_name);
        assert!(!std::path::Path::new(&first.mapping_name).exists());
        assert!(std::path::Path::new(&second.mapping_name).exists());
        assert!(!service.is_reading("s"));
        assert_eq!(service.session_ids(), vec!["s".to_string()]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (service, _frames) = service(&dir);

        let descriptor = service.allocate_or_replace("s", 4096).await.unwrap();
        service.release("s").await;
        service.release("s").await;
        service.cleanup("never-allocated").await;

        assert!(!std::path::Path::new(&descriptor.mapping_name).exists());
        assert!(service.segment("s").is_none());
    }

    #[tokio::test]
    async fn test_frame_ids_survive_replace_but_not_cleanup() {
        let dir = TempDir::new().unwrap();
        let (service, mut frames) = service(&dir);

        service.allocate_or_replace("s", 4096).await.unwrap();
        service.start_reading("s", "text").unwrap();
        service.start_reading("s", "text").unwrap();
        service.segment("s").unwrap().try_write_frame(b"a").unwrap();
        let first = frames.recv().await.unwrap();
        assert_eq!(first.frame_id, 1);
        assert_eq!(first.format, "text");

        service.allocate_or_replace("s", 4096).await.unwrap();
        service.start_reading("s", "text").unwrap();
        service.segment("s").unwrap().try_write_frame(b"b").unwrap();
        assert_eq!(frames.recv().await.unwrap().frame_id, 2);

        service.cleanup("s").await;
        service.allocate_or_replace("s", 4096).await.unwrap();
        service.start_reading("s", "text").unwrap();
        service.segment("s").unwrap().try_write_frame(b"c").unwrap();
        assert_eq!(frames.recv().await.unwrap().frame_id, 1);

        service.release_all().await;
        assert!(service.session_ids().is_empty());
    }

    #[test]
    fn test_file_tag_is_filesystem_safe() {
        assert_eq!(file_tag("a/b c"), "a_b_c");
        assert_eq!(file_tag(&"x".repeat(200)).len(), FILE_TAG_LEN);
    }
}

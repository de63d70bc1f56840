//! One-way event channel from a host to the supervisor: newline-delimited
//! JSON [`HostEvent`]s over a Unix domain socket whose path the host receives
//! at launch.

use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::protocol::HostEvent;

const MAX_EVENT_LEN: usize = 1024 * 1024;

pub struct EventListener {
    path: PathBuf,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventListener {
    /// Bind `path` and forward every well-formed event to `events`.
    pub fn bind(path: &Path, events: mpsc::UnboundedSender<HostEvent>) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to bind event socket {}: {}",
                path.display(),
                e
            ))
        })?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(listener, events, cancel.clone()));

        Ok(Self {
            path: path.to_path_buf(),
            cancel,
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stop(self, timeout: Duration) {
        self.cancel.cancel();
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            abort.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove event socket: {}", e);
            }
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    events: mpsc::UnboundedSender<HostEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(read_events(stream, events.clone(), cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!("Event socket accept failed: {}", e);
                    break;
                }
            },
        }
    }
}

async fn read_events(
    stream: UnixStream,
    events: mpsc::UnboundedSender<HostEvent>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_EVENT_LEN));
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        match line {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HostEvent>(&line) {
                    Ok(event) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Discarding malformed host event: {}", e);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Event channel read failed: {}", e);
                break;
            }
            None => break,
        }
    }
}

/// Host side of the event channel.
pub struct EventSender {
    sink: Mutex<FramedWrite<UnixStream, LinesCodec>>,
}

impl EventSender {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to connect to event socket {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            sink: Mutex::new(FramedWrite::new(stream, LinesCodec::new())),
        })
    }

    pub async fn send(&self, event: &HostEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        self.sink
            .lock()
            .await
            .send(line)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_events_flow_from_sender_to_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = EventListener::bind(&path, tx).unwrap();

        let sender = EventSender::connect(&path).await.unwrap();
        let event = HostEvent::HostRegistered {
            token: "tok".to_string(),
            process_id: 7,
        };
        sender.send(&event).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);

        listener.stop(Duration::from_millis(200)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = EventListener::bind(&path, tx).unwrap();

        let mut raw = UnixStream::connect(&path).await.unwrap();
        raw.write_all(b"not json\n{\"event\":\"host-registered\",\"token\":\"t\",\"processId\":1}\n")
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.name(), "host-registered");

        listener.stop(Duration::from_millis(200)).await;
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::Connection;
use crate::error::{Result, TransportError};

/// Lines longer than this are treated as a broken peer.
const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited message channel over any async byte stream pair, used
/// for a child's stdin/stdout as well as in-memory pipes.
pub struct LineConnection {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl LineConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for LineConnection {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !data.ends_with(b"\n") {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed.into());
            }

            let mut line = Vec::new();
            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

            if n == 0 {
                self.closed.store(true, Ordering::SeqCst);
                return Err(TransportError::Closed.into());
            }
            if line.len() > MAX_LINE_LEN {
                return Err(TransportError::InvalidFormat.into());
            }

            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            // Blank keep-alive lines carry nothing.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Bytes::from(line));
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Failed to shut down line writer: {}", e);
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SupervisorError;

    #[tokio::test]
    async fn test_messages_are_split_on_newlines() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let local = LineConnection::new(our_read, our_write);
        let remote = LineConnection::new(their_read, their_write);

        local.send(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        local.send(Bytes::from_static(b"{\"b\":2}\n")).await.unwrap();

        assert_eq!(remote.recv().await.unwrap().as_ref(), b"{\"a\":1}");
        assert_eq!(remote.recv().await.unwrap().as_ref(), b"{\"b\":2}");
    }

    #[tokio::test]
    async fn test_two_messages_in_one_write_are_both_delivered() {
        let (mut raw, theirs) = tokio::io::duplex(1024);
        let (their_read, their_write) = tokio::io::split(theirs);
        let remote = LineConnection::new(their_read, their_write);

        raw.write_all(b"first\n\nsecond\n").await.unwrap();

        assert_eq!(remote.recv().await.unwrap().as_ref(), b"first");
        assert_eq!(remote.recv().await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_eof_closes_connection() {
        let (raw, theirs) = tokio::io::duplex(64);
        let (their_read, their_write) = tokio::io::split(theirs);
        let remote = LineConnection::new(their_read, their_write);
        drop(raw);

        let err = remote.recv().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Transport(TransportError::Closed)
        ));
        assert!(remote.is_closed());
        assert!(remote.send(Bytes::from_static(b"x")).await.is_err());
    }
}

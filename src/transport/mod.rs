use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod events;
pub mod line;

pub use events::{EventListener, EventSender};
pub use line::LineConnection;

/// A bidirectional, message-framed byte channel. One message per `recv`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn recv(&self) -> Result<Bytes>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

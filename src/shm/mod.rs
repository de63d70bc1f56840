//! Shared-memory data plane: ring segments, their descriptors, the per-session
//! segment service and the ingest readers draining them.

pub mod descriptor;
pub mod reader;
pub mod segment;
pub mod service;

pub use descriptor::SegmentDescriptor;
pub use reader::{FrameDirection, FrameReceiver, FrameRecord, SegmentReader};
pub use segment::{SegmentStatistics, SharedMemorySegment};
pub use service::{SegmentServiceOptions, SegmentSessionService};

pub mod backpressure;
pub mod commands;
pub mod config;
pub mod control;
pub mod error;
pub mod host;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod shm;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use error::{Result, SupervisorError};
pub use runtime::{RuntimeStatus, Supervisor, SupervisorEvent};

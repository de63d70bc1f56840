use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Cloneable view of a host process: its pid, a way to ask it to stop and a
/// way to learn when it is gone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    terminate: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
}

/// The side that owns the actual process and reports its exit.
pub struct ProcessControl {
    terminate: CancellationToken,
    exit: watch::Sender<Option<ProcessExit>>,
}

impl ProcessControl {
    /// Resolves once someone asked the process to stop.
    pub async fn terminate_requested(&self) {
        self.terminate.cancelled().await
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn exited(&self, exit: ProcessExit) {
        self.exit.send_replace(Some(exit));
    }
}

impl ProcessHandle {
    pub fn channel(pid: u32) -> (ProcessHandle, ProcessControl) {
        let terminate = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        (
            ProcessHandle {
                pid,
                terminate: terminate.clone(),
                exit: rx,
            },
            ProcessControl {
                terminate,
                exit: tx,
            },
        )
    }

    /// Take ownership of a spawned child. A termination request sends SIGTERM
    /// and escalates to SIGKILL after `grace`.
    pub fn spawn_child(mut child: Child, plugin_id: &str, grace: Duration) -> Result<Self> {
        let pid = child.id().ok_or_else(|| SupervisorError::StartFailed {
            plugin: plugin_id.to_string(),
            reason: "process exited before its id could be read".to_string(),
        })?;
        let (handle, control) = Self::channel(pid);
        let plugin_id = plugin_id.to_string();

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => status.map(ProcessExit::from_status).unwrap_or_else(|e| {
                    tracing::warn!(plugin = %plugin_id, pid, "Failed to wait for host process: {}", e);
                    ProcessExit::unknown()
                }),
                _ = control.terminate_requested() => {
                    terminate_child(&mut child, pid, &plugin_id, grace).await
                }
            };
            tracing::debug!(plugin = %plugin_id, pid, %exit, "Host process exited");
            control.exited(exit);
        });

        Ok(handle)
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Wait for the process to exit.
    pub async fn exited(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or_else(ProcessExit::unknown),
            // The owner vanished without reporting; nothing is left to wait for.
            Err(_) => ProcessExit::unknown(),
        };
        status
    }

    /// Wait up to `timeout`; `None` means the process is still running.
    pub async fn wait(&self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.exited()).await.ok()
    }
}

async fn terminate_child(child: &mut Child, pid: u32, plugin_id: &str, grace: Duration) -> ProcessExit {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(plugin = %plugin_id, pid, "SIGTERM failed: {}", e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return ProcessExit::from_status(status),
        Ok(Err(e)) => {
            tracing::warn!(plugin = %plugin_id, pid, "Failed to wait for host process: {}", e);
        }
        Err(_) => {
            tracing::warn!(plugin = %plugin_id, pid, "Host process ignored SIGTERM, killing");
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(plugin = %plugin_id, pid, "Failed to kill host process: {}", e);
    }
    child
        .wait()
        .await
        .map(ProcessExit::from_status)
        .unwrap_or_else(|_| ProcessExit::unknown())
}

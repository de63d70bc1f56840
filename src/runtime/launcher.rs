use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::process::ProcessHandle;
use crate::error::{Result, SupervisorError};
use crate::protocol::HostEvent;
use crate::transport::{Connection, EventListener, LineConnection};

/// Everything needed to start one host process generation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub plugin_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub host_token: String,
    pub event_endpoint: PathBuf,
}

impl LaunchSpec {
    /// Configured arguments followed by the identity flags every host parses.
    pub fn host_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--plugin-id".to_string(),
            self.plugin_id.clone(),
            "--host-token".to_string(),
            self.host_token.clone(),
            "--event-endpoint".to_string(),
            self.event_endpoint.display().to_string(),
        ]);
        args
    }
}

pub struct LaunchedHost {
    pub process: ProcessHandle,
    pub control: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    /// Listener to stop when this generation is torn down, if the launcher bound one.
    pub event_listener: Option<EventListener>,
}

#[async_trait]
pub trait HostLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedHost>;
}

/// Launches hosts as child processes: control over stdin/stdout, events over
/// a Unix socket, stderr forwarded to the log.
pub struct ProcessLauncher {
    terminate_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl HostLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedHost> {
        let start_failed = |reason: String| SupervisorError::StartFailed {
            plugin: spec.plugin_id.clone(),
            reason,
        };

        if let Some(dir) = spec.event_endpoint.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let (tx, events) = mpsc::unbounded_channel();
        let listener = EventListener::bind(&spec.event_endpoint, tx)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(spec.host_args())
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                listener.stop(Duration::from_millis(100)).await;
                return Err(start_failed(format!(
                    "failed to spawn '{}': {}",
                    spec.command, e
                )));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            listener.stop(Duration::from_millis(100)).await;
            return Err(start_failed("failed to capture host stdio".to_string()));
        };

        if let Some(stderr) = child.stderr.take() {
            let plugin_id = spec.plugin_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %plugin_id, "host stderr: {}", line);
                }
            });
        }

        let process = ProcessHandle::spawn_child(child, &spec.plugin_id, self.terminate_grace)?;
        tracing::info!(
            plugin = %spec.plugin_id,
            pid = process.id(),
            command = %spec.command,
            "Launched host process"
        );

        Ok(LaunchedHost {
            process,
            control: Arc::new(LineConnection::new(stdout, stdin)),
            events,
            event_listener: Some(listener),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> LaunchSpec {
        LaunchSpec {
            plugin_id: "p".to_string(),
            command: command.to_string(),
            args: vec!["--verbose".to_string()],
            env: HashMap::new(),
            working_directory: None,
            host_token: "tok".to_string(),
            event_endpoint: PathBuf::from("/tmp/p.sock"),
        }
    }

    #[test]
    fn test_host_args_append_identity_flags() {
        assert_eq!(
            spec("host").host_args(),
            vec![
                "--verbose",
                "--plugin-id",
                "p",
                "--host-token",
                "tok",
                "--event-endpoint",
                "/tmp/p.sock"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut spec = spec("/nonexistent/plugin-host");
        spec.event_endpoint = dir.path().join("events.sock");

        let err = match ProcessLauncher::default().launch(&spec).await {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SupervisorError::StartFailed { .. }));
        assert!(!spec.event_endpoint.exists());
    }
}

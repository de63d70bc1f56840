use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::error::{ConfigError, Result, SupervisorError};
use crate::runtime::{ProcessLauncher, Supervisor};

/// Validate `config` and, with `ping`, start every enabled plugin once to
/// confirm it handshakes and to list its capabilities.
pub async fn run_config_check(config: Config, ping: bool, print: bool) -> Result<()> {
    info!("Checking configuration...");
    config::validate(&config)?;
    info!("✓ Configuration is valid");

    if print {
        let rendered = serde_yaml::to_string(&config)
            .map_err(|e| ConfigError::Parse(format!("failed to render configuration: {e}")))?;
        println!("{rendered}");
    }

    let mut names: Vec<&String> = config.plugins.keys().collect();
    names.sort();
    info!("Checking {} plugin(s)...", names.len());
    for name in &names {
        let plugin = &config.plugins[*name];
        info!("\n--- Plugin: {} ---", name);
        info!("  Command: {} {}", plugin.command, plugin.args.join(" "));
        if !plugin.enabled {
            info!("  Disabled");
        }
        if !plugin.shared_memory_hints.is_empty() {
            info!("  Shared memory hints: {:?}", plugin.shared_memory_hints);
        }
    }

    if !ping {
        return Ok(());
    }

    let launcher = Arc::new(ProcessLauncher::new(config.supervisor.terminate_grace()));
    let (supervisor, _frames) = Supervisor::new(config, launcher)?;
    let mut all_ok = true;

    for (name, result) in supervisor.start_all().await {
        match result {
            Ok(()) => {
                info!("✓ {}: started", name);
                if let Ok(snapshot) = supervisor.snapshot(&name) {
                    if let Some(reason) = &snapshot.capabilities_error {
                        warn!("  ! Capabilities unavailable: {}", reason);
                    }
                    for capability in &snapshot.capabilities {
                        info!(
                            "  - {} ({}){}",
                            capability.id,
                            capability.display_name,
                            capability
                                .shared_memory
                                .as_ref()
                                .map(|s| format!(", shared memory >= {} bytes", s.min_bytes))
                                .unwrap_or_default()
                        );
                    }
                }
            }
            Err(e) => {
                error!("✗ {}: {}", name, e);
                all_ok = false;
            }
        }
    }

    supervisor.shutdown().await;

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(SupervisorError::Config(ConfigError::Validation(
            "One or more plugins failed to start".to_string(),
        )))
    }
}

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use plugin_supervisor::commands;
use plugin_supervisor::config::{self, Config, LoggingConfig};
use plugin_supervisor::runtime::ProcessLauncher;
use plugin_supervisor::shm::FrameReceiver;
use plugin_supervisor::Supervisor;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "plugin-supervisor")]
#[command(about = "Supervises process-isolated plugin hosts and drains their shared memory rings", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start every enabled plugin and run until interrupted (default)
    Run,
    /// Validate the configuration
    Check {
        /// Start each enabled plugin once and list its capabilities
        #[arg(long)]
        ping: bool,
        /// Print the effective configuration as YAML
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("failed to load configuration")?,
    };

    let _log_guard = init_tracing(&config.logging, args.debug)?;
    info!("Loaded {} plugin configuration(s)", config.plugins.len());

    match args.command.unwrap_or(Command::Run) {
        Command::Check { ping, print } => {
            commands::run_config_check(config, ping, print).await?;
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

fn init_tracing(
    logging: &LoggingConfig,
    debug: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if debug {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let filter = || -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::from_default_env().add_directive(
            format!("plugin_supervisor={level}")
                .parse()
                .context("invalid log level")?,
        ))
    };

    let stdout_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("failed to create log directory {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::daily(directory, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter()?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer.with_filter(filter()?))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(config: Config) -> anyhow::Result<()> {
    config::validate(&config)?;
    info!("Starting plugin supervisor");

    let launcher = Arc::new(ProcessLauncher::new(config.supervisor.terminate_grace()));
    let (supervisor, frames) = Supervisor::new(config, launcher)?;

    let frame_logger = tokio::spawn(log_frames(frames));
    let event_logger = tokio::spawn(log_events(supervisor.subscribe()));

    let results = supervisor.start_all().await;
    let loaded = results.iter().filter(|(_, r)| r.is_ok()).count();
    info!("{} of {} plugin(s) loaded", loaded, results.len());

    shutdown_signal().await;
    info!("Shutting down plugin supervisor");

    match tokio::time::timeout(SHUTDOWN_DEADLINE, supervisor.shutdown()).await {
        Ok(()) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    event_logger.abort();
    frame_logger.abort();
    Ok(())
}

async fn log_frames(mut frames: FrameReceiver) {
    while let Some(frame) = frames.recv().await {
        debug!(
            session_id = %frame.session_id,
            frame_id = frame.frame_id,
            bytes = frame.payload.len(),
            format = %frame.format,
            "Frame received"
        );
    }
}

async fn log_events(mut events: broadcast::Receiver<plugin_supervisor::SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "Supervisor event"),
                Err(e) => warn!("Failed to render supervisor event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Supervisor event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

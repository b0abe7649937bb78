//! bridge-agent entry point
//!
//! Wires configuration, transport, executor, HTTP facade and OS signals
//! around an [`AgentRuntime`].

use bridge_agent::agent::{AgentRuntime, EchoExecutor, HttpTaskExecutor, TaskExecutor};
use bridge_agent::config::AgentConfig;
use bridge_agent::error::{AgentError, AgentResult};
use bridge_agent::observability::{init_default_logging, parse_level, ApiServer};
use bridge_agent::protocol::RuntimeState;
use bridge_agent::transport::{BrokerConnection, MemoryBus, MqttTransport, Transport};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "bridge-agent")]
#[command(about = "Bus-connected worker agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BRIDGE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, register and process tasks until told to stop
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = load_configuration(cli.config.as_deref());

    let configured_level = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.log_level.as_deref())
        .and_then(parse_level);
    let default_level = match cli.verbose {
        0 => configured_level.unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_default_logging(default_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> AgentResult<AgentConfig> {
    if let Some(path) = config_path {
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for candidate in ["bridge-agent.toml", "config/bridge-agent.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(AgentConfig::load_from_file(path)?);
        }
    }

    // Defaults are a complete configuration on their own
    Ok(AgentConfig::with_defaults())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal(format!("Could not render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!(agent_id = %config.agent.id, "Configuration is valid");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    info!(
        agent_id = %config.agent.id,
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.url,
        "Starting bridge agent"
    );

    if config.broker.url.starts_with("memory://") {
        warn!("Using the in-process memory bus; nothing outside this process can reach the agent");
        let bus = MemoryBus::new();
        run_with_transport(config, bus.transport()).await
    } else {
        let transport = MqttTransport::new(config.agent.id.clone())
            .with_credentials(config.broker_credentials()?);
        run_with_transport(config, transport).await
    }
}

async fn run_with_transport<T: Transport>(config: AgentConfig, transport: T) -> AgentResult<()> {
    match config.executor_config() {
        Some(executor_config) => {
            info!(url = %executor_config.url, "Using HTTP task executor");
            let executor = HttpTaskExecutor::new(executor_config)?;
            serve(config, transport, executor).await
        }
        None => {
            warn!("No executor URL configured; tasks will be echoed back");
            serve(config, transport, EchoExecutor).await
        }
    }
}

async fn serve<T: Transport, E: TaskExecutor>(
    config: AgentConfig,
    transport: T,
    executor: E,
) -> AgentResult<()> {
    let runtime = AgentRuntime::new(
        config.identity(),
        config.runtime_settings(),
        BrokerConnection::new(transport),
        executor,
    );

    let (api_stop_tx, api_stop_rx) = oneshot::channel::<()>();
    let (shutdown_requested, api_handle) = if config.api.enabled {
        let api = ApiServer::new(runtime.clone(), config.health.metrics_enabled);
        let requested = api.shutdown_requested();
        let (_, handle) = api
            .spawn(config.api_address()?, async move {
                let _ = api_stop_rx.await;
            })
            .map_err(|e| AgentError::internal(format!("HTTP API could not bind: {e}")))?;
        (Some(requested), Some(handle))
    } else {
        (None, None)
    };

    let started = runtime.start().await;
    let mut waited = Ok(());
    if started.is_ok() {
        info!("Agent is running and waiting for tasks");
        waited = wait_for_shutdown(runtime.state_receiver(), shutdown_requested).await;
        runtime.stop().await;
    }

    let _ = api_stop_tx.send(());
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            warn!("HTTP API task ended abnormally: {}", e);
        }
    }

    started?;
    waited?;
    info!("Agent shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(
    mut state: watch::Receiver<RuntimeState>,
    shutdown_requested: Option<watch::Receiver<bool>>,
) -> AgentResult<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| AgentError::internal(format!("Cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| AgentError::internal(format!("Cannot install SIGTERM handler: {e}")))?;

    let http_shutdown = async move {
        match shutdown_requested {
            Some(mut requested) => {
                if requested.wait_for(|flag| *flag).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = http_shutdown => info!("Shutdown requested over HTTP"),
        reached = state.wait_for(|s| matches!(s, RuntimeState::Stopped | RuntimeState::Error)) => {
            match reached {
                Ok(s) => info!(state = %*s, "Runtime left the running state"),
                Err(_) => warn!("Runtime state channel closed"),
            }
        }
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use netmon_agent::agent::Agent;
use netmon_agent::collector;
use netmon_agent::config::Config;
use netmon_agent::transmitter::{Transmitter, WebSocketSettings, WebSocketTransmitter};

#[derive(Parser, Debug)]
#[command(name = "netmon-agent", about = "Network telemetry agent")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/netmon-agent/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// Override agent.backend_url
    #[arg(long)]
    backend_url: Option<String>,

    /// Override agent.agent_id
    #[arg(long)]
    agent_id: Option<String>,

    /// Override agent.log_level
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("netmon-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(&cli.config)?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %config.agent.agent_id,
        backend = %config.agent.backend_url,
        "Starting netmon agent"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.backend_url {
        config.agent.backend_url = url.clone();
    }
    if let Some(id) = &cli.agent_id {
        config.agent.agent_id = id.clone();
    }
    if let Some(level) = &cli.log_level {
        config.agent.log_level = level.clone();
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let collectors = collector::create_collectors(&config)?;

    let transmitter: Arc<dyn Transmitter> = Arc::new(WebSocketTransmitter::new(
        config.agent.backend_url.clone(),
        config.agent.agent_id.clone(),
        config.location.clone(),
        WebSocketSettings::from(&config.transmitter),
    ));

    let mut agent = Agent::new(&config, collectors, transmitter);
    agent.start().await.context("Failed to start agent")?;

    info!("Agent running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    agent.stop().await;

    let status = agent.status().await;
    info!(dropped_metrics = status.dropped_metrics, "Shutdown complete");
    Ok(())
}

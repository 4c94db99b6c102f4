//! fleetd - Fleet node daemon
//!
//! Runs the node's service containers, keeps the detection-agent fleet in
//! line with the desired set published on the bus and fans block/transaction
//! evaluation requests out to every healthy agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::{
    init_tracing, publish_json, Coordinator, CoordinatorConfig, HttpConnector,
    HttpConnectorConfig, LocalBus, NodeConfig,
};
use fleet_engine::DockerEngine;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fleet node agent daemon", long_about = None)]
struct Cli {
    /// Node configuration file (TOML)
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "FLEET_LOG_JSON")]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Remove stopped containers and dangling images before starting
    #[arg(long)]
    prune: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    if cli.check_config {
        info!(
            agents = config.agents.len(),
            services = config.services.len(),
            "configuration is valid"
        );
        return Ok(());
    }

    let engine = DockerEngine::connect(config.docker.clone())
        .context("Failed to connect to the container engine")?;
    let connector = HttpConnector::new(HttpConnectorConfig {
        container_prefix: config.node.container_prefix.clone(),
        ..HttpConnectorConfig::default()
    })
    .context("Failed to build the agent RPC client")?;
    let bus = Arc::new(LocalBus::new());

    let coordinator = Coordinator::new(
        Arc::new(engine),
        Arc::new(connector),
        bus.clone(),
        CoordinatorConfig::from(&config),
    );

    if cli.prune {
        coordinator.prune().await.context("Prune failed")?;
    }

    let services = coordinator
        .bootstrap()
        .await
        .context("Failed to start node services")?;
    info!(node = %config.node.name, services = services.len(), "node services running");

    let handle = coordinator.start();

    // Single-node deployments have no external registry; the static agent
    // list stands in for it.
    if !config.agents.is_empty() {
        publish_json(bus.as_ref(), &config.subjects.desired, &config.agents)
            .context("Failed to publish the static agent set")?;
        info!(agents = config.agents.len(), "published static agent set");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!(error = %e, "signal handler failed, shutting down"),
    }
    handle.shutdown().await;
    info!("fleetd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "fleetd",
            "--config",
            "/etc/fleet/node.toml",
            "--json",
            "--prune",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fleet/node.toml")));
        assert!(cli.json);
        assert!(cli.prune);
        assert!(!cli.check_config);
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/fleet.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}

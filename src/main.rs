//! WolfCluster - Cluster Membership and Message Replication
//!
//! Runs a cluster coordinator node that tracks membership through a
//! pluggable scheme and replays buffered messages to members that join late.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcluster::api::HttpServer;
use wolfcluster::cluster::FnListener;
use wolfcluster::config::WolfClusterConfig;
use wolfcluster::coordinator::Coordinator;
use wolfcluster::error::{Error, Result};

/// WolfCluster - Cluster Membership and Message Replication
#[derive(Parser)]
#[command(name = "wolfcluster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcluster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cluster node
    Start,

    /// Query a running node's status API
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcluster.toml")]
        output: PathBuf,

        /// Node ID (random when omitted)
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact");
            run_status(address).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the cluster node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = WolfClusterConfig::from_file(&config_path)?;

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    tracing::info!("Starting WolfCluster node {}", config.node.id);
    tracing::info!("Domain: {}", config.cluster.domain);
    tracing::info!("Membership scheme: {}", config.cluster.membership_scheme);

    let coordinator = Coordinator::new(config.clone())?;

    coordinator.add_membership_listener(Arc::new(
        FnListener::new("log")
            .on_added(|event| {
                tracing::info!("Member joined: {}", event.member);
                Ok(())
            })
            .on_removed(|event| {
                tracing::info!("Member left: {}", event.member);
                Ok(())
            }),
    ));

    let mut inbound = coordinator.subscribe();
    let inbound_task = tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Ok(message) => tracing::info!(
                    "Received message {} from {} ({} bytes)",
                    message.sequence,
                    message.origin,
                    message.payload.len()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Inbound log lagged, skipped {} message(s)", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    coordinator.start().await?;

    let api = HttpServer::new(config.api.clone(), coordinator.clone());
    let api_shutdown = api.shutdown_token();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tracing::info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    api_shutdown.cancel();
    let _ = api_task.await;

    coordinator.stop().await?;
    inbound_task.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Print a running node's cluster view
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/cluster", address);

    let response = reqwest::get(&url).await.map_err(|e| {
        eprintln!("Failed to get status: {}", e);
        Error::Network(e.to_string())
    })?;
    let status: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let pretty =
        serde_json::to_string_pretty(&status).map_err(|e| Error::Network(e.to_string()))?;
    println!("{}", pretty);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));
    let config_content = format!(
        r#"# WolfCluster Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
# advertise_address = "my-public-ip:7700"

[node.properties]
# zone = "eu-west-1a"

[cluster]
domain = "wolfcluster.domain"
membership_scheme = "wka"

[cluster.parameters]
members = "node-1.example.com:7700,node-2.example.com:7700"
# probe_interval_ms = "2000"
# max_missed_probes = "3"
# grace_period_ms = "5000"

[replay]
# grace_period_ms = 5000
max_attempts = 5
initial_backoff_ms = 200
max_backoff_ms = 5000
send_timeout_ms = 5000
workers = 8

[buffer]
capacity = 10000
retention_secs = 300
cleanup_interval_secs = 120

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the membership scheme and its parameters.");
    println!(
        "Then start with: wolfcluster --config {} start",
        output.display()
    );

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Advertise Address: {}", config.advertise_address());
            println!("  Domain: {}", config.cluster.domain);
            println!("  Membership Scheme: {}", config.cluster.membership_scheme);
            println!("  Scheme Parameters: {}", config.cluster.parameters.len());
            println!("  Buffer: {} messages / {}s", config.buffer.capacity, config.buffer.retention_secs);
            println!(
                "  Replay: {} attempt(s), {} worker(s)",
                config.replay.max_attempts, config.replay.workers
            );
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration is invalid: {}", e);
            Err(e)
        }
    }
}

//! NodePulse - Node Status & Event Propagation Engine
//!
//! Collector binary: ingests agent heartbeats, maintains liveness
//! status, and pushes changes to observers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodepulse::api::HttpServer;
use nodepulse::broadcast::RealtimeBroadcaster;
use nodepulse::config::NodePulseConfig;
use nodepulse::engine::Engine;
use nodepulse::error::Result;
use nodepulse::lookup::{AsnLookupProvider, DisabledAsnProvider, HttpAsnProvider};
use nodepulse::poller::{HttpSnapshotSource, ReconciliationPoller};
use nodepulse::store::{PersistenceGateway, SqliteStore};

/// NodePulse - Node Status & Event Propagation Engine
#[derive(Parser)]
#[command(name = "nodepulse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "nodepulse.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collector
    Start,

    /// Show fleet status from a running collector
    Status {
        /// Collector address to query
        #[arg(short, long, default_value = "http://localhost:8090")]
        address: String,
    },

    /// Show the event log for one node
    Events {
        /// Agent id to query
        agent_id: String,

        /// Collector address to query
        #[arg(short, long, default_value = "http://localhost:8090")]
        address: String,

        /// Number of events to fetch
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Poll a collector and print fleet changes as they happen
    Watch {
        /// Collector address to poll
        #[arg(short, long, default_value = "http://localhost:8090")]
        address: String,

        /// Poll interval in seconds
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "nodepulse.toml")]
        output: PathBuf,

        /// Collector instance id
        #[arg(long, default_value = "collector-1")]
        engine_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show collector configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Events {
            agent_id,
            address,
            limit,
        } => run_events(address, agent_id, limit).await,
        Commands::Watch { address, interval } => run_watch(address, interval).await,
        Commands::Init { output, engine_id } => run_init(output, engine_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the collector
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting NodePulse collector...");

    let config = match NodePulseConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for collector: {}", config.engine.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!(
            "Failed to create data directory {:?}: {}",
            config.data_dir(),
            e
        );
        return Err(e.into());
    }

    let store: Arc<dyn PersistenceGateway> = match SqliteStore::new(config.data_dir().clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to open store in {:?}: {}", config.data_dir(), e);
            return Err(e);
        }
    };

    let lookup: Arc<dyn AsnLookupProvider> = if config.lookup.enabled {
        tracing::info!("ASN lookup enabled via {}", config.lookup.base_url);
        Arc::new(HttpAsnProvider::new(&config.lookup))
    } else {
        tracing::info!("ASN lookup disabled");
        Arc::new(DisabledAsnProvider)
    };

    let broadcaster = Arc::new(RealtimeBroadcaster::new());
    let engine = Arc::new(Engine::new(&config, store, lookup, broadcaster));

    let loaded = engine.bootstrap().await?;
    tracing::info!(
        "Engine ready: {} node(s) restored, sweep every {:?}",
        loaded,
        config.sweep_interval()
    );

    // Background sweep demotes silent nodes
    let sweeper = tokio::spawn(Arc::clone(&engine).run_sweeper());

    let http_server = HttpServer::new(config.api.clone(), config.engine.id.clone(), engine);

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    sweeper.abort();
    tracing::info!("NodePulse shutdown complete");
    Ok(())
}

/// Query fleet status from a running collector
async fn run_status(address: String) -> Result<()> {
    let url = format!("{}/api/snapshot", address.trim_end_matches('/'));

    match reqwest::get(&url).await {
        Ok(response) => {
            let snapshot: serde_json::Value = response
                .json()
                .await
                .map_err(|e| nodepulse::Error::Network(e.to_string()))?;

            if let Some(stats) = snapshot.get("stats") {
                println!("Fleet: {} total, {} online, {} unknown, {} offline, {} maintenance",
                    stats["total_nodes"], stats["online"], stats["unknown"],
                    stats["offline"], stats["maintenance"]);
                println!();
            }
            if let Some(nodes) = snapshot.get("nodes").and_then(|n| n.as_array()) {
                for node in nodes {
                    println!(
                        "{:<20} {:<12} {:<16} last seen {}",
                        node["agent_id"].as_str().unwrap_or("?"),
                        node["status"].as_str().unwrap_or("?"),
                        node["ipv4"].as_str().unwrap_or("-"),
                        node["last_seen"].as_str().unwrap_or("?"),
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(nodepulse::Error::Network(e.to_string()))
        }
    }
}

/// Print the event log for one node
async fn run_events(address: String, agent_id: String, limit: usize) -> Result<()> {
    let url = format!(
        "{}/api/nodes/{}/events?limit={}",
        address.trim_end_matches('/'),
        agent_id,
        limit
    );

    match reqwest::get(&url).await {
        Ok(response) => {
            if !response.status().is_success() {
                eprintln!("Collector returned {}", response.status());
                return Err(nodepulse::Error::Network(format!(
                    "events endpoint returned {}",
                    response.status()
                )));
            }
            let events: serde_json::Value = response
                .json()
                .await
                .map_err(|e| nodepulse::Error::Network(e.to_string()))?;

            if let Some(events) = events.as_array() {
                for event in events {
                    println!(
                        "{}  {:<20} {}",
                        event["timestamp"].as_str().unwrap_or("?"),
                        event["type"].as_str().unwrap_or("?"),
                        event["message"].as_str().unwrap_or(""),
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get events: {}", e);
            Err(nodepulse::Error::Network(e.to_string()))
        }
    }
}

/// Poll the collector and print changes
async fn run_watch(address: String, interval: u64) -> Result<()> {
    let source = Arc::new(HttpSnapshotSource::new(&address));
    let poller = ReconciliationPoller::new(source, Duration::from_secs(interval.max(1)));

    println!("Watching {} (poll every {}s, Ctrl-C to stop)", address, interval);

    let mut ticker = tokio::time::interval(poller.interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match poller.tick().await {
                    Ok(Some(diff)) => {
                        for node in &diff.changed {
                            println!(
                                "{}  {:<20} -> {:<12} ipv4={}",
                                chrono::Utc::now().format("%H:%M:%S"),
                                node.agent_id,
                                node.status,
                                node.ipv4.as_deref().unwrap_or("-"),
                            );
                        }
                        for agent_id in &diff.removed {
                            println!(
                                "{}  {:<20} removed from snapshot",
                                chrono::Utc::now().format("%H:%M:%S"),
                                agent_id
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("poll failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped");
                return Ok(());
            }
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, engine_id: String) -> Result<()> {
    let config_content = format!(
        r#"# NodePulse Configuration
# Generated configuration file

[engine]
id = "{engine_id}"
data_dir = "/var/lib/nodepulse"

[timeouts]
# Seconds without a heartbeat before an online node becomes unknown
grace_window_secs = 90
# Seconds without a heartbeat before an unknown node becomes offline
offline_window_secs = 600
# Interval between background sweep passes
sweep_interval_secs = 15

[lookup]
enabled = true
base_url = "https://asn.internal/v1/lookup"
timeout_secs = 3

[api]
bind_address = "0.0.0.0:8090"
cors_enabled = false

[logging]
level = "info"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure timeouts and the lookup endpoint.");
    println!("Then start with: nodepulse start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match NodePulseConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Engine ID: {}", config.engine.id);
            println!("  Bind Address: {}", config.api.bind_address);
            println!(
                "  Windows: grace {}s, offline {}s, sweep {}s",
                config.timeouts.grace_window_secs,
                config.timeouts.offline_window_secs,
                config.timeouts.sweep_interval_secs
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show collector configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = NodePulseConfig::from_file(&config_path)?;

    println!("NodePulse Collector Information");
    println!("===============================");
    println!();
    println!("Engine ID:        {}", config.engine.id);
    println!("Bind Address:     {}", config.api.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Timeout Windows:");
    println!("  Grace:          {} s", config.timeouts.grace_window_secs);
    println!("  Offline:        {} s", config.timeouts.offline_window_secs);
    println!("  Sweep:          {} s", config.timeouts.sweep_interval_secs);
    println!();
    println!("ASN Lookup:");
    println!("  Enabled:        {}", config.lookup.enabled);
    println!("  Endpoint:       {}", config.lookup.base_url);
    println!("  Timeout:        {} s", config.lookup.timeout_secs);
    println!();
    println!("API:");
    println!("  CORS:           {}", config.api.cors_enabled);

    Ok(())
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Beacon announcement agent CLI
//!
//! Announces service instances in an in-process coordination service and
//! keeps them announced across connection drills.
//!
//! # Usage
//!
//! ```bash
//! # Announce a single address
//! beacon-agent --cluster profile-service --address http://10.0.0.12:8080/profile
//!
//! # Using configuration file
//! beacon-agent --config beacon.toml
//!
//! # Drop and restore the connection every 20 seconds
//! beacon-agent --config beacon.toml --flap-interval 20
//!
//! # Expire the session once after 60 seconds
//! beacon-agent --config beacon.toml --expire-after 60
//! ```

use beacon::local::{LocalConnection, LocalEnsemble};
use beacon::{
    AgentConfig, AnnounceError, AnnouncerConfig, Callback, ConfigError, ConnectionManager,
    Scheduler, TokioScheduler,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

/// Beacon service announcement agent
#[derive(Parser, Debug)]
#[command(name = "beacon-agent")]
#[command(about = "Beacon - service announcement with dark warmup and reconnect recovery")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster to announce in
    #[arg(long, conflicts_with = "config")]
    cluster: Option<String>,

    /// Address to announce
    #[arg(long, conflicts_with = "config")]
    address: Option<String>,

    /// Status reporting interval (seconds, 0 to disable)
    #[arg(long)]
    status_interval: Option<u64>,

    /// Drill: drop and restore the connection every N seconds
    #[arg(long, default_value = "0")]
    flap_interval: u64,

    /// Drill: expire the session once after N seconds
    #[arg(long)]
    expire_after: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "beacon.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle subcommands
    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    let ensemble = LocalEnsemble::new();
    let connection = Arc::new(LocalConnection::new(ensemble.clone()));
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(Handle::current()));

    let announcers = config
        .announcers
        .iter()
        .map(|a| a.build(Arc::clone(&scheduler)))
        .collect::<Result<Vec<_>, AnnounceError>>()?;

    let manager = ConnectionManager::new(
        announcers,
        connection.clone(),
        Arc::new(connection.store_factory()),
    )?;

    println!("Beacon Agent v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();

    for announcer in &config.announcers {
        match &announcer.warmup_cluster {
            Some(warmup) if announcer.warmup_enabled => println!(
                "Announce: {} in {} (warmup {} for {}s)",
                announcer.address, announcer.cluster, warmup, announcer.warmup_duration_secs
            ),
            _ => println!("Announce: {} in {}", announcer.address, announcer.cluster),
        }
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let (cb, started) = Callback::channel();
    manager.start(cb);
    started.await?;

    manager.mark_up_all_servers(None);

    // Status reporting task
    let status_interval = args.status_interval.unwrap_or(config.status_interval_secs);
    if status_interval > 0 {
        let ensemble = ensemble.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(status_interval));
            loop {
                interval.tick().await;
                if !manager.is_started() {
                    break;
                }
                print_status(&ensemble, &manager);
            }
        });
    }

    if args.flap_interval > 0 {
        let connection = connection.clone();
        let period = Duration::from_secs(args.flap_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                connection.disconnect();
                tokio::time::sleep(period).await;
                connection.reconnect();
            }
        });
    }

    if let Some(secs) = args.expire_after {
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            connection.expire_session();
        });
    }

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    // Restore the connection so the mark-down can reach the store.
    connection.reconnect();
    let (cb, down) = Callback::channel();
    manager.mark_down_all_servers(Some(cb));
    match tokio::time::timeout(Duration::from_secs(5), down).await {
        Ok(Ok(())) => println!("All servers marked down"),
        Ok(Err(e)) => eprintln!("markDown failed: {}", e),
        Err(_) => eprintln!("markDown timed out"),
    }

    let (cb, stopped) = Callback::channel();
    manager.shutdown(cb);
    stopped.await?;

    println!("\nFinal Status:");
    print_status(&ensemble, &manager);

    Ok(())
}

fn build_config(args: &Args) -> Result<AgentConfig, ConfigError> {
    // Load from file if specified
    if let Some(ref config_path) = args.config {
        return AgentConfig::from_file(config_path);
    }

    // Build from command line arguments
    let cluster = args
        .cluster
        .clone()
        .ok_or_else(|| ConfigError::Invalid("Missing --cluster (or use --config)".into()))?;

    let address = args
        .address
        .clone()
        .ok_or_else(|| ConfigError::Invalid("Missing --address (or use --config)".into()))?;

    let mut config = AgentConfig::single(cluster, address);
    config.log_level = args.log_level.clone();
    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig {
        name: "example-agent".into(),
        announcers: vec![
            AnnouncerConfig::new("profile-service", "http://10.0.0.12:8080/profile")
                .warmup("profile-service-warmup", 30)
                .partition(0, 1.0)
                .property("zone", serde_json::json!("us-east-1a")),
            AnnouncerConfig::new("search-service", "http://10.0.0.12:8081/search")
                .partition(1, 0.5)
                .partition(2, 1.5),
        ],
        ..Default::default()
    };

    let toml_str = config.to_toml()?;

    // Add comments
    let content = format!(
        r#"# Beacon Agent Configuration
# Generated by beacon-agent gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match AgentConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Agent: {}", config.name);
            println!("Announcers: {}", config.announcers.len());
            for (i, announcer) in config.announcers.iter().enumerate() {
                println!(
                    "  [{}] {} in {} {}",
                    i,
                    announcer.address,
                    announcer.cluster,
                    if announcer.warmup_enabled {
                        "(dark warmup)"
                    } else {
                        ""
                    }
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_status(ensemble: &LocalEnsemble, manager: &ConnectionManager) {
    println!("--- Announcers ---");
    for announcer in manager.announcers() {
        let status = announcer.status();
        let state = if status.dark_warmup_intent_sent {
            "warming up"
        } else if status.mark_up_intent_sent {
            "up"
        } else if status.mark_down_intent_sent {
            "down"
        } else {
            "idle"
        };
        println!(
            "  {} in {}: {}{}",
            status
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<no address>".into()),
            status.cluster,
            state,
            if announcer.last_mark_up_failed() {
                " (last markUp failed)"
            } else {
                ""
            }
        );
    }

    println!("--- Ensemble ---");
    for cluster in ensemble.snapshot() {
        println!("  {}: {} uris", cluster.cluster(), cluster.len());
        for uri in cluster.uris() {
            println!("    {}", uri);
        }
    }
}

//! rpcpool probe - connectivity check for configured downstream services
//!
//! Provisions one pool per configured service and reports pool statistics
//! as JSON on stdout. Logs go to stderr.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use rpcpool::{DownstreamConfig, Manager, PoolStats};

/// Probe the connection pools of configured downstream services
#[derive(Parser, Debug)]
#[command(name = "rpcpool-probe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "RPCPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    Test,
    /// Provision pools once, print their stats and exit (default)
    Check,
    /// Print pool stats periodically until interrupted
    Watch {
        /// Seconds between reports
        #[arg(short = 'i', long = "interval", default_value_t = 5)]
        interval: u64,
    },
}

/// One line of probe output.
#[derive(Serialize)]
struct Report {
    healthy: bool,
    pools: BTreeMap<String, PoolReport>,
}

#[derive(Serialize)]
struct PoolReport {
    healthy_percentage: f64,
    #[serde(flatten)]
    stats: PoolStats,
}

impl Report {
    fn new(stats: BTreeMap<String, PoolStats>) -> Self {
        let healthy = stats.values().all(PoolStats::is_healthy);
        let pools = stats
            .into_iter()
            .map(|(service, stats)| {
                let report = PoolReport {
                    healthy_percentage: stats.healthy_percentage(),
                    stats,
                };
                (service, report)
            })
            .collect();
        Self { healthy, pools }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = DownstreamConfig::load(cli.config.as_deref())
        .context("Failed to load downstream configuration")?;

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Test => test_config(&config),
        Commands::Check => run(config, None),
        Commands::Watch { interval } => {
            if interval == 0 {
                bail!("--interval must be at least 1 second");
            }
            run(config, Some(Duration::from_secs(interval)))
        }
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

/// Configuration was already loaded and validated; summarize it.
fn test_config(config: &DownstreamConfig) -> Result<()> {
    let configured = config.configured_services().count();
    info!("Configuration test successful:");
    info!("  - {} service(s) declared", config.services.len());
    info!("  - {} service(s) configured", configured);
    info!("  - {} connection(s) per pool", config.pool.pool_size);

    for (service, target) in &config.services {
        if target.trim().is_empty() {
            warn!("Service '{}' has no target and will not be provisioned", service);
        }
    }

    println!("rpcpool-probe: configuration test is successful");
    Ok(())
}

fn run(config: DownstreamConfig, watch: Option<Duration>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let manager = Manager::new();

        let outcome = probe(&manager, &config, watch).await;

        if let Err(e) = manager.close().await {
            warn!(error = %e, "Failed to close pools cleanly");
        }
        outcome
    })
}

async fn probe(
    manager: &Manager,
    config: &DownstreamConfig,
    watch: Option<Duration>,
) -> Result<()> {
    let provisioned = manager
        .provision(config)
        .await
        .context("Failed to provision downstream pools")?;
    info!(services = provisioned, "Pools provisioned");

    let Some(interval) = watch else {
        let report = Report::new(manager.get_all_stats().await);
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.healthy {
            bail!("One or more downstream pools are unhealthy");
        }
        return Ok(());
    };

    loop {
        let report = Report::new(manager.get_all_stats().await);
        println!("{}", serde_json::to_string(&report)?);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcpool::ConnectivityState;

    #[test]
    fn test_cli_parses_watch() {
        let cli = Cli::try_parse_from(["rpcpool-probe", "-c", "pools.toml", "watch", "-i", "2"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("pools.toml")));
        assert!(matches!(cli.command, Some(Commands::Watch { interval: 2 })));
    }

    #[test]
    fn test_cli_defaults_to_check() {
        let cli = Cli::try_parse_from(["rpcpool-probe", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_report_flags_unhealthy_pool() {
        let mut stats = BTreeMap::new();
        stats.insert(
            "order-service".to_string(),
            PoolStats::from_states("orders:9000", [ConnectivityState::Ready, ConnectivityState::Idle]),
        );
        stats.insert(
            "user-service".to_string(),
            PoolStats::from_states("users:7000", [ConnectivityState::TransientFailure]),
        );

        let report = Report::new(stats);
        assert!(!report.healthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pools"]["order-service"]["healthy_percentage"], 100.0);
        assert_eq!(json["pools"]["order-service"]["ready"], 1);
        assert_eq!(json["pools"]["user-service"]["transient_failure"], 1);
    }
}

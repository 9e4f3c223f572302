//! cwsprobe — operator CLI for the CloudWorkstation connection core.
//!
//! Probes ports, runs one-shot SSH/HTTP health checks, waits for the
//! daemon, and runs continuous reliability monitoring from a TOML file.
//!
//! # Usage
//!
//! ```text
//! cwsprobe connect 10.0.0.5 22
//! cwsprobe port 10.0.0.5 22 --wait 2m
//! cwsprobe health http 10.0.0.5 8080 --path /healthz
//! cwsprobe daemon --url http://localhost:8947 --wait 30s
//! cwsprobe --config cws.toml monitor
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use cws_connection::{
    ConnectionConfig, ConnectionManager, DaemonConnectionManager, HealthResult,
    HttpReliabilityChecker, ReliabilityManager, parse_duration,
};
use cws_metrics::{PerformanceMonitor, SharedMetrics, render_prometheus};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cwsprobe", about = "CloudWorkstation connection probe")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print collected metrics in Prometheus text format on exit.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to host:port with retry and exponential backoff.
    Connect { host: String, port: u16 },

    /// Test whether a TCP port accepts connections.
    Port {
        host: String,
        port: u16,

        /// Keep polling until the port opens or this much time passes.
        #[arg(long, value_parser = duration_arg)]
        wait: Option<Duration>,

        /// Timeout of a single probe.
        #[arg(long, value_parser = duration_arg, default_value = "5s")]
        timeout: Duration,
    },

    /// One-shot service health check.
    Health {
        #[command(subcommand)]
        check: HealthCommand,
    },

    /// Wait for the control-plane daemon and print its connection stats.
    Daemon {
        /// Daemon base URL (overrides the config file).
        #[arg(long)]
        url: Option<String>,

        /// How long to wait for the daemon.
        #[arg(long, value_parser = duration_arg, default_value = "30s")]
        wait: Duration,
    },

    /// Continuously monitor the `[[targets]]` of the config file.
    Monitor {
        /// Stop after this long instead of waiting for Ctrl-C.
        #[arg(long, value_parser = duration_arg)]
        duration: Option<Duration>,
    },
}

#[derive(Subcommand)]
enum HealthCommand {
    /// SSH port availability.
    Ssh {
        host: String,
        #[arg(long, default_value = "22")]
        port: u16,
    },
    /// GET http://host:port/path after a port check.
    Http {
        host: String,
        port: u16,
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// GET an arbitrary URL; 2xx and 3xx are healthy.
    Url { url: String },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?} (try 500ms, 30s, 2m)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cwsprobe=debug,cws_connection=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::default(),
    };

    let monitor = Arc::new(PerformanceMonitor::new());
    let metrics: SharedMetrics = monitor.clone();
    let cancel = shutdown_token();

    let outcome = match cli.command {
        Command::Connect { host, port } => run_connect(&config, metrics, &host, port, &cancel).await,
        Command::Port {
            host,
            port,
            wait,
            timeout,
        } => run_port(metrics, &host, port, wait, timeout, &cancel).await,
        Command::Health { check } => run_health(metrics, check, &cancel).await,
        Command::Daemon { url, wait } => run_daemon(&config, metrics, url, wait, &cancel).await,
        Command::Monitor { duration } => run_monitor(&config, metrics, duration, cancel).await,
    };

    if cli.metrics {
        print!("{}", render_prometheus(&monitor.metrics()));
    }
    outcome
}

/// Token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "failed to install Ctrl-C handler"),
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_connect(
    config: &ConnectionConfig,
    metrics: SharedMetrics,
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let manager = ConnectionManager::with_policy(metrics, config.retry_policy()?);
    let outcome = manager.connect_with_retry(host, port, cancel).await;

    if let Some(state) = manager.connection_state(&format!("{host}:{port}")).await {
        print_json(&state)?;
    }
    let result = outcome?;
    print_json(&result)?;
    Ok(())
}

async fn run_port(
    metrics: SharedMetrics,
    host: &str,
    port: u16,
    wait: Option<Duration>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(metrics);
    match wait {
        Some(max_wait) => {
            manager
                .wait_for_port_availability(host, port, max_wait, cancel)
                .await?
        }
        None => manager.test_port_availability(host, port, timeout, cancel).await?,
    }
    println!("{host}:{port} is open");
    Ok(())
}

async fn run_health(
    metrics: SharedMetrics,
    check: HealthCommand,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (result, outcome): (HealthResult, _) = match check {
        HealthCommand::Ssh { host, port } => {
            ConnectionManager::new(metrics).health_check_ssh(&host, port, cancel).await
        }
        HealthCommand::Http { host, port, path } => {
            ConnectionManager::new(metrics)
                .health_check_http(&host, port, &path, cancel)
                .await
        }
        HealthCommand::Url { url } => {
            HttpReliabilityChecker::new(metrics).check_endpoint(&url, cancel).await
        }
    };

    print_json(&result)?;
    outcome.with_context(|| format!("{} health check failed", result.service))
}

async fn run_daemon(
    config: &ConnectionConfig,
    metrics: SharedMetrics,
    url: Option<String>,
    wait: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let url = url.unwrap_or_else(|| config.daemon_url().to_string());
    let daemon = DaemonConnectionManager::with_settings(&url, metrics, config.daemon_settings()?).await?;

    let waited = daemon.wait_for_daemon(wait, cancel).await;
    print_json(&daemon.connection_stats().await)?;
    waited.with_context(|| format!("daemon at {url} is not available"))
}

async fn run_monitor(
    config: &ConnectionConfig,
    metrics: SharedMetrics,
    duration: Option<Duration>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if config.targets.is_empty() {
        bail!("no [[targets]] to monitor; pass --config with at least one target");
    }

    let settings = config.reliability_settings()?;
    let report_every = settings.check_interval;
    let connections = Arc::new(ConnectionManager::with_policy(metrics.clone(), config.retry_policy()?));
    let reliability = ReliabilityManager::with_settings(connections, metrics, settings);

    for target in &config.targets {
        reliability.add_check(&target.host, target.port, target.service()).await;
    }
    info!(targets = config.targets.len(), "monitoring started");

    if let Some(limit) = duration {
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            stop.cancel();
        });
    }

    // Sweep once up front so the first report has data.
    reliability.perform_sweep(&cancel).await;

    let sweeper = reliability.clone();
    let sweep_cancel = cancel.clone();
    let sweep = tokio::spawn(async move { sweeper.start(sweep_cancel).await });

    let mut ticker = tokio::time::interval(report_every);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => print_json(&reliability.healthy_summary().await)?,
        }
    }

    if let Err(e) = sweep.await {
        warn!(error = %e, "reliability sweep task failed");
    }

    let mut checks: Vec<_> = reliability.all_checks().await.into_values().collect();
    checks.sort_by(|a, b| a.key().cmp(&b.key()));
    print_json(&checks)?;
    info!("monitoring stopped");
    Ok(())
}

//! Connection attempts with retry, TCP port probes, and one-shot health
//! checks.
//!
//! The [`ConnectionManager`] owns a per-address map of [`ConnectionState`]
//! records for introspection. Network I/O never happens under its lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use cws_metrics::{OperationTimer, SharedMetrics};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Result};
use crate::http::HttpClient;
use crate::policy::RetryPolicy;
use crate::types::{
    ConnectionResult, ConnectionState, ConnectionStats, ConnectionStatus, HealthResult, address_key,
};

/// Dial timeout for a single `connect_with_retry` attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Probe timeout used by the SSH and HTTP health checks.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval of `wait_for_port_availability`.
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Per-probe timeout inside `wait_for_port_availability`.
pub const PORT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Makes connections with retry and probes TCP/HTTP services.
pub struct ConnectionManager {
    policy: RetryPolicy,
    metrics: SharedMetrics,
    /// Per-address state: `host:port` → state.
    connections: RwLock<HashMap<String, ConnectionState>>,
    http: HttpClient,
    attempt_timeout: Duration,
    port_poll_interval: Duration,
}

impl ConnectionManager {
    /// Create a manager with the default retry policy.
    pub fn new(metrics: SharedMetrics) -> Self {
        Self::with_policy(metrics, RetryPolicy::default())
    }

    /// Create a manager with a custom retry policy.
    pub fn with_policy(metrics: SharedMetrics, policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics,
            connections: RwLock::new(HashMap::new()),
            http: HttpClient::new(HEALTH_PROBE_TIMEOUT),
            attempt_timeout: ATTEMPT_TIMEOUT,
            port_poll_interval: PORT_POLL_INTERVAL,
        }
    }

    /// Override the per-attempt dial timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Override the poll interval of `wait_for_port_availability`.
    pub fn with_port_poll_interval(mut self, interval: Duration) -> Self {
        self.port_poll_interval = interval;
        self
    }

    /// The retry policy this manager was built with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect to `target:port`, retrying with exponential backoff.
    ///
    /// Each call starts a fresh [`ConnectionState`] for the address. Returns
    /// `RetriesExhausted` after `max_retries + 1` failed attempts, or
    /// `Cancelled` (state `timeout`) as soon as `cancel` fires.
    pub async fn connect_with_retry(
        &self,
        target: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<ConnectionResult> {
        let _timer = OperationTimer::start(&self.metrics, "connection_attempt");
        let address = address_key(target, port);
        self.init_state(&address).await;

        let attempts = self.policy.total_attempts();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(self.cancel_connect(&address, "connection").await);
            }

            self.mark_attempt(&address, attempt + 1).await;

            let started = Instant::now();
            match self.dial(target, port, self.attempt_timeout, cancel).await {
                Ok(()) => {
                    self.update_state(&address, ConnectionStatus::Connected, None).await;
                    info!(%address, attempt = attempt + 1, "connection established");
                    return Ok(ConnectionResult {
                        address,
                        connected: true,
                        latency: started.elapsed(),
                    });
                }
                Err(e) if e.is_cancelled() => {
                    return Err(self.cancel_connect(&address, "connection").await);
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.update_state(&address, ConnectionStatus::Failed, Some(last_error.clone()))
                        .await;
                    self.metrics.record_value("connection_failures", 1.0, "count");
                    debug!(%address, attempt = attempt + 1, error = %e, "connection attempt failed");
                }
            }

            if attempt + 1 >= attempts {
                break;
            }

            let delay = self.policy.delay_for(attempt);
            self.set_next_retry(&address, delay).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.cancel_connect(&address, "connection retry").await);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        warn!(%address, attempts, "connection retries exhausted");
        Err(ConnectionError::RetriesExhausted {
            address,
            attempts,
            last_error,
        })
    }

    /// Check once whether `target:port` accepts a TCP connection.
    ///
    /// The connection is closed immediately. No retry.
    pub async fn test_port_availability(
        &self,
        target: &str,
        port: u16,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _timer = OperationTimer::start(&self.metrics, "port_test");

        match self.dial(target, port, timeout, cancel).await {
            Ok(()) => {
                self.metrics.record_value("port_test_successes", 1.0, "count");
                Ok(())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.metrics.record_value("port_test_failures", 1.0, "count");
                }
                Err(e)
            }
        }
    }

    /// Poll `target:port` until it accepts connections or `max_wait` elapses.
    pub async fn wait_for_port_availability(
        &self,
        target: &str,
        port: u16,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _timer = OperationTimer::start(&self.metrics, "port_wait");

        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.port_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ConnectionError::cancelled(format!(
                        "wait for port {port} on {target}"
                    )));
                }
                _ = &mut deadline => {
                    return Err(ConnectionError::Timeout {
                        waiting_for: format!("port {port} on {target}"),
                        max_wait,
                    });
                }
                _ = ticker.tick() => {
                    let probe = self.test_port_availability(target, port, PORT_POLL_TIMEOUT, cancel);
                    tokio::select! {
                        biased;
                        _ = &mut deadline => {
                            return Err(ConnectionError::Timeout {
                                waiting_for: format!("port {port} on {target}"),
                                max_wait,
                            });
                        }
                        result = probe => match result {
                            Ok(()) => {
                                debug!(host = %target, port, "port became available");
                                return Ok(());
                            }
                            Err(e) if e.is_cancelled() => return Err(e),
                            Err(e) => debug!(host = %target, port, error = %e, "port not yet available"),
                        },
                    }
                }
            }
        }
    }

    /// SSH reachability: the port accepting connections is treated as
    /// sufficient evidence. Always returns a [`HealthResult`].
    pub async fn health_check_ssh(
        &self,
        target: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> (HealthResult, Result<()>) {
        let _timer = OperationTimer::start(&self.metrics, "ssh_health_check");
        let checked_at = SystemTime::now();
        let started = Instant::now();

        match self
            .test_port_availability(target, port, HEALTH_PROBE_TIMEOUT, cancel)
            .await
        {
            Ok(()) => (HealthResult::healthy("ssh", checked_at, started.elapsed()), Ok(())),
            Err(e) => (
                HealthResult::unhealthy("ssh", e.to_string(), checked_at, started.elapsed()),
                Err(e),
            ),
        }
    }

    /// HTTP reachability: port check first, then one GET to
    /// `http://target:port/path`. Status codes ≥ 400 are unhealthy.
    pub async fn health_check_http(
        &self,
        target: &str,
        port: u16,
        path: &str,
        cancel: &CancellationToken,
    ) -> (HealthResult, Result<()>) {
        let _timer = OperationTimer::start(&self.metrics, "http_health_check");
        let service = format!("http:{port}");
        let checked_at = SystemTime::now();
        let started = Instant::now();

        if let Err(e) = self
            .test_port_availability(target, port, HEALTH_PROBE_TIMEOUT, cancel)
            .await
        {
            return (
                HealthResult::unhealthy(service, e.to_string(), checked_at, started.elapsed()),
                Err(e),
            );
        }

        let url = health_url(target, port, path);
        match self.http.get(&url, cancel).await {
            Ok(resp) if resp.status().as_u16() >= 400 => {
                let status = resp.status();
                (
                    HealthResult::unhealthy(
                        service,
                        format!("HTTP {status}"),
                        checked_at,
                        started.elapsed(),
                    ),
                    Err(ConnectionError::Status { url, status }),
                )
            }
            Ok(_) => (HealthResult::healthy(service, checked_at, started.elapsed()), Ok(())),
            Err(e) => (
                HealthResult::unhealthy(service, e.to_string(), checked_at, started.elapsed()),
                Err(e),
            ),
        }
    }

    /// Snapshot of all tracked addresses grouped by status.
    pub async fn connection_stats(&self) -> ConnectionStats {
        let connections = self.connections.read().await;
        let mut stats = ConnectionStats {
            total_connections: connections.len(),
            ..ConnectionStats::default()
        };
        for state in connections.values() {
            *stats.connections_by_status.entry(state.status).or_insert(0) += 1;
        }
        stats
    }

    /// Snapshot of the state for one `host:port` address.
    pub async fn connection_state(&self, address: &str) -> Option<ConnectionState> {
        self.connections.read().await.get(address).cloned()
    }

    /// One bounded TCP dial, closed immediately on success.
    async fn dial(
        &self,
        target: &str,
        port: u16,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let connect = tokio::time::timeout(timeout, TcpStream::connect((target, port)));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::cancelled(format!(
                "dial to {target}:{port}"
            ))),
            result = connect => match result {
                Ok(Ok(stream)) => {
                    drop(stream);
                    Ok(())
                }
                Ok(Err(source)) => Err(ConnectionError::Dial {
                    target: target.to_string(),
                    port,
                    source,
                }),
                Err(_) => Err(ConnectionError::DialTimeout {
                    target: target.to_string(),
                    port,
                    timeout,
                }),
            },
        }
    }

    async fn init_state(&self, address: &str) {
        let mut connections = self.connections.write().await;
        connections.insert(address.to_string(), ConnectionState::pending(address));
    }

    async fn mark_attempt(&self, address: &str, attempt: u32) {
        let mut connections = self.connections.write().await;
        if let Some(state) = connections.get_mut(address) {
            state.status = ConnectionStatus::Connecting;
            state.attempts = attempt;
            state.last_attempt = Some(SystemTime::now());
        }
    }

    async fn update_state(&self, address: &str, status: ConnectionStatus, error: Option<String>) {
        let mut connections = self.connections.write().await;
        if let Some(state) = connections.get_mut(address) {
            state.status = status;
            state.last_error = error;
        }
    }

    async fn set_next_retry(&self, address: &str, delay: Duration) {
        let mut connections = self.connections.write().await;
        if let Some(state) = connections.get_mut(address) {
            state.next_retry = Some(SystemTime::now() + delay);
        }
    }

    async fn cancel_connect(&self, address: &str, operation: &str) -> ConnectionError {
        self.update_state(address, ConnectionStatus::Timeout, Some("cancelled".to_string()))
            .await;
        ConnectionError::cancelled(format!("{operation} to {address}"))
    }
}

/// Build `http://target:port/path`, tolerating a missing leading slash.
fn health_url(target: &str, port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://{target}:{port}{path}")
    } else {
        format!("http://{target}:{port}/{path}")
    }
}

/// Convenience for sharing one manager between components.
pub type SharedConnectionManager = Arc<ConnectionManager>;

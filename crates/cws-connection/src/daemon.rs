//! Connection façade for the local control-plane daemon.
//!
//! Combines a [`ConnectionManager`] and a [`ReliabilityManager`] scoped to
//! the daemon's address with an HTTP health convention
//! (`GET {base}/api/v1/health` → 200) and a request wrapper that waits for
//! the daemon before sending and retries transport failures.
//!
//! ```text
//! DaemonConnectionManager::start(cancel)
//!   ├── ReliabilityManager::start    TCP sweep of host:port
//!   └── health loop                  verify_daemon_health() now, then every 30s
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use cws_metrics::{OperationTimer, SharedMetrics};
use http::{Request, Response, StatusCode, Uri};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Result};
use crate::http::HttpClient;
use crate::manager::ConnectionManager;
use crate::policy::{RetryPolicy, linear_backoff};
use crate::reliability::{ReliabilityManager, ReliabilitySettings};
use crate::types::{ConnectionStats, ReliabilitySummary};

/// Default daemon base URL.
pub const DEFAULT_DAEMON_URL: &str = "http://localhost:8947";

/// Path of the daemon health endpoint.
pub const HEALTH_PATH: &str = "/api/v1/health";

/// Tunables for a [`DaemonConnectionManager`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonSettings {
    /// Interval of the background health loop.
    pub health_interval: Duration,
    /// Timeout of each HTTP exchange with the daemon.
    pub request_timeout: Duration,
    /// How long a request waits for an unhealthy daemon before giving up.
    pub recovery_wait: Duration,
    /// Sends per request, including the first.
    pub request_attempts: u32,
    /// Backoff step: attempt `n` sleeps `(n + 1) × request_backoff`.
    pub request_backoff: Duration,
    pub retry: RetryPolicy,
    pub reliability: ReliabilitySettings,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            recovery_wait: Duration::from_secs(30),
            request_attempts: 3,
            request_backoff: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            reliability: ReliabilitySettings::default(),
        }
    }
}

/// A parsed daemon base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonEndpoint {
    /// Base URL without a trailing slash.
    pub base_url: String,
    pub host: String,
    pub port: u16,
}

impl DaemonEndpoint {
    pub fn health_url(&self) -> String {
        format!("{}{HEALTH_PATH}", self.base_url)
    }
}

/// Parse a daemon base URL such as `http://localhost:8947`.
///
/// The port defaults to 80 or 443 by scheme.
pub fn parse_daemon_url(url: &str) -> Result<DaemonEndpoint> {
    let invalid = |reason: String| ConnectionError::InvalidDaemonUrl {
        url: url.to_string(),
        reason,
    };

    let uri: Uri = url.trim().parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    let default_port = match uri.scheme_str() {
        Some("http") => 80,
        Some("https") => 443,
        Some(other) => return Err(invalid(format!("unsupported scheme {other:?}"))),
        None => return Err(invalid("missing scheme".to_string())),
    };
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;

    Ok(DaemonEndpoint {
        base_url: url.trim().trim_end_matches('/').to_string(),
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port: uri.port_u16().unwrap_or(default_port),
    })
}

/// Snapshot of the daemon connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonConnectionStats {
    pub daemon_url: String,
    pub is_healthy: bool,
    pub last_health_check: Option<SystemTime>,
    pub connection_stats: ConnectionStats,
    pub reliability_stats: ReliabilitySummary,
}

#[derive(Debug, Default)]
struct DaemonHealth {
    is_healthy: bool,
    last_health_check: Option<SystemTime>,
}

/// Reliable access to the daemon. Cloning yields a handle to the same state.
#[derive(Clone)]
pub struct DaemonConnectionManager {
    endpoint: DaemonEndpoint,
    connections: Arc<ConnectionManager>,
    reliability: ReliabilityManager,
    http: HttpClient,
    metrics: SharedMetrics,
    health: Arc<RwLock<DaemonHealth>>,
    settings: Arc<DaemonSettings>,
}

impl DaemonConnectionManager {
    /// Create a manager for the daemon at `url` with default settings.
    pub async fn new(url: &str, metrics: SharedMetrics) -> Result<Self> {
        Self::with_settings(url, metrics, DaemonSettings::default()).await
    }

    /// Create a manager and register the `"daemon"` reliability check.
    ///
    /// The daemon is considered unhealthy until first verified.
    pub async fn with_settings(
        url: &str,
        metrics: SharedMetrics,
        settings: DaemonSettings,
    ) -> Result<Self> {
        let endpoint = parse_daemon_url(url)?;

        let connections = Arc::new(ConnectionManager::with_policy(
            metrics.clone(),
            settings.retry.clone(),
        ));
        let reliability = ReliabilityManager::with_settings(
            connections.clone(),
            metrics.clone(),
            settings.reliability.clone(),
        );
        reliability.add_check(&endpoint.host, endpoint.port, "daemon").await;

        debug!(url = %endpoint.base_url, host = %endpoint.host, port = endpoint.port, "daemon connection manager created");

        Ok(Self {
            http: HttpClient::new(settings.request_timeout),
            endpoint,
            connections,
            reliability,
            metrics,
            health: Arc::new(RwLock::new(DaemonHealth::default())),
            settings: Arc::new(settings),
        })
    }

    pub fn endpoint(&self) -> &DaemonEndpoint {
        &self.endpoint
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn reliability_manager(&self) -> &ReliabilityManager {
        &self.reliability
    }

    /// Spawn the reliability sweep and the daemon health loop.
    ///
    /// Both tasks exit when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let reliability = self.reliability.clone();
        let sweep_cancel = cancel.clone();
        let sweep = tokio::spawn(async move { reliability.start(sweep_cancel).await });

        let daemon = self.clone();
        let health = tokio::spawn(async move { daemon.health_loop(cancel).await });

        info!(url = %self.endpoint.base_url, "daemon monitoring started");
        vec![sweep, health]
    }

    async fn health_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(url = %self.endpoint.base_url, "daemon health loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.verify_daemon_health(&cancel).await {
                        Ok(()) => {}
                        Err(e) if e.is_cancelled() => return,
                        Err(e) => debug!(error = %e, "periodic daemon health check failed"),
                    }
                }
            }
        }
    }

    /// GET the health endpoint. 200 marks the daemon healthy; any other
    /// status or a transport error marks it unhealthy.
    pub async fn verify_daemon_health(&self, cancel: &CancellationToken) -> Result<()> {
        let _timer = OperationTimer::start(&self.metrics, "daemon_health_verify");
        let url = self.endpoint.health_url();

        match self.http.get(&url, cancel).await {
            Ok(resp) if resp.status() == StatusCode::OK => {
                self.update_health(true).await;
                Ok(())
            }
            Ok(resp) => {
                self.update_health(false).await;
                Err(ConnectionError::Status {
                    url,
                    status: resp.status(),
                })
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                self.update_health(false).await;
                Err(e)
            }
        }
    }

    /// Wait for the daemon's port to become healthy, then confirm over HTTP.
    pub async fn wait_for_daemon(&self, max_wait: Duration, cancel: &CancellationToken) -> Result<()> {
        let _timer = OperationTimer::start(&self.metrics, "daemon_wait");
        info!(url = %self.endpoint.base_url, ?max_wait, "waiting for daemon");

        self.reliability
            .wait_for_healthy(&self.endpoint.host, self.endpoint.port, max_wait, cancel)
            .await?;
        self.verify_daemon_health(cancel).await
    }

    /// Send `request`, waiting for an unhealthy daemon first and retrying
    /// transport failures with linear backoff.
    ///
    /// Any HTTP status counts as a successful exchange.
    pub async fn make_request_with_retry(
        &self,
        request: &Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Response<Bytes>> {
        let _timer = OperationTimer::start(&self.metrics, "daemon_request_with_retry");

        if !self.is_healthy().await {
            let max_wait = self.settings.recovery_wait;
            let waited = tokio::time::timeout(max_wait, self.wait_for_daemon(max_wait, cancel))
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionError::Timeout {
                        waiting_for: "daemon".to_string(),
                        max_wait,
                    })
                });
            if let Err(e) = waited {
                warn!(url = %self.endpoint.base_url, error = %e, "daemon unavailable, request not sent");
                return Err(ConnectionError::DaemonUnavailable {
                    url: self.endpoint.base_url.clone(),
                    source: Box::new(e),
                });
            }
        }

        let attempts = self.settings.request_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.http.send(request, cancel).await {
                Ok(response) => {
                    self.update_health(true).await;
                    return Ok(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        uri = %request.uri(),
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "daemon request failed"
                    );
                    self.update_health(false).await;
                    self.metrics.record_value("daemon_request_failures", 1.0, "count");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                let delay = linear_backoff(self.settings.request_backoff, attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(ConnectionError::cancelled(format!("request to {}", request.uri())));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(ConnectionError::RequestFailed {
            target: request.uri().to_string(),
            attempts,
            source: Box::new(last_error.unwrap_or_else(|| {
                ConnectionError::InvalidRequest("no attempts made".to_string())
            })),
        })
    }

    /// Last known daemon health.
    pub async fn is_healthy(&self) -> bool {
        self.health.read().await.is_healthy
    }

    pub async fn connection_stats(&self) -> DaemonConnectionStats {
        let connection_stats = self.connections.connection_stats().await;
        let reliability_stats = self.reliability.healthy_summary().await;
        let health = self.health.read().await;

        DaemonConnectionStats {
            daemon_url: self.endpoint.base_url.clone(),
            is_healthy: health.is_healthy,
            last_health_check: health.last_health_check,
            connection_stats,
            reliability_stats,
        }
    }

    async fn update_health(&self, healthy: bool) {
        let mut health = self.health.write().await;
        let changed = health.is_healthy != healthy;
        health.is_healthy = healthy;
        health.last_health_check = Some(SystemTime::now());
        drop(health);

        if healthy {
            self.metrics.record_value("daemon_health_checks_success", 1.0, "count");
        } else {
            self.metrics.record_value("daemon_health_checks_failure", 1.0, "count");
        }
        if changed {
            if healthy {
                info!(url = %self.endpoint.base_url, "daemon healthy");
            } else {
                warn!(url = %self.endpoint.base_url, "daemon unhealthy");
            }
        }
    }
}

//! Continuous reliability monitoring for a registry of targets.
//!
//! The [`ReliabilityManager`] periodically sweeps every registered target
//! with a TCP probe and feeds the outcome into that target's
//! [`ReliabilityCheck`] state machine.
//!
//! # Sweep
//!
//! ```text
//! start(cancel)
//!   └── every check_interval
//!       └── perform_sweep()
//!           ├── JoinSet: one probe task per registered target
//!           │   └── copy record → release lock → probe → re-lock → observe
//!           └── join all before the next tick
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cws_metrics::{OperationTimer, SharedMetrics};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Result};
use crate::manager::ConnectionManager;
use crate::tracker::{HealthThresholds, Observation, ReliabilityCheck};
use crate::types::{ReliabilityStatus, ReliabilitySummary, address_key};

/// Tunables for a [`ReliabilityManager`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilitySettings {
    /// Interval between full sweeps.
    pub check_interval: Duration,
    /// Timeout of each sweep probe.
    pub probe_timeout: Duration,
    /// Poll interval of `wait_for_healthy`.
    pub wait_poll_interval: Duration,
    pub thresholds: HealthThresholds,
    /// When false, `start` returns immediately.
    pub enabled: bool,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            wait_poll_interval: Duration::from_secs(5),
            thresholds: HealthThresholds::default(),
            enabled: true,
        }
    }
}

/// Registry of monitored targets with hysteretic health tracking.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct ReliabilityManager {
    connections: Arc<ConnectionManager>,
    metrics: SharedMetrics,
    /// Registered checks: `target:port` → record.
    checks: Arc<RwLock<HashMap<String, ReliabilityCheck>>>,
    settings: Arc<ReliabilitySettings>,
}

impl ReliabilityManager {
    /// Create a manager with default settings.
    pub fn new(connections: Arc<ConnectionManager>, metrics: SharedMetrics) -> Self {
        Self::with_settings(connections, metrics, ReliabilitySettings::default())
    }

    /// Create a manager with custom settings.
    pub fn with_settings(
        connections: Arc<ConnectionManager>,
        metrics: SharedMetrics,
        settings: ReliabilitySettings,
    ) -> Self {
        Self {
            connections,
            metrics,
            checks: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ReliabilitySettings {
        &self.settings
    }

    /// Register a target. Re-registering resets it to a fresh `healthy`
    /// record.
    pub async fn add_check(&self, target: &str, port: u16, service: &str) {
        let check = ReliabilityCheck::new(target, port, service);
        let mut checks = self.checks.write().await;
        checks.insert(check.key(), check);
        debug!(host = %target, port, %service, "reliability check registered");
    }

    /// Stop tracking a target.
    pub async fn remove_check(&self, target: &str, port: u16) {
        let mut checks = self.checks.write().await;
        if checks.remove(&address_key(target, port)).is_some() {
            debug!(host = %target, port, "reliability check removed");
        }
    }

    /// Snapshot of one target's record.
    pub async fn reliability_status(&self, target: &str, port: u16) -> Option<ReliabilityCheck> {
        self.checks.read().await.get(&address_key(target, port)).cloned()
    }

    /// Snapshot of every registered record.
    pub async fn all_checks(&self) -> HashMap<String, ReliabilityCheck> {
        self.checks.read().await.clone()
    }

    /// Whether a registered target is currently `healthy`.
    pub async fn is_healthy(&self, target: &str, port: u16) -> bool {
        self.reliability_status(target, port)
            .await
            .is_some_and(|c| c.status == ReliabilityStatus::Healthy)
    }

    /// Aggregate status counts across the registry.
    pub async fn healthy_summary(&self) -> ReliabilitySummary {
        let checks = self.checks.read().await;
        let mut summary = ReliabilitySummary::default();

        for check in checks.values() {
            summary.total_checks += 1;
            *summary.status_counts.entry(check.status).or_insert(0) += 1;
            if check.status == ReliabilityStatus::Healthy {
                summary.healthy_checks += 1;
            }
        }

        if summary.total_checks > 0 {
            summary.overall_healthiness =
                summary.healthy_checks as f64 / summary.total_checks as f64;
        }
        summary
    }

    /// Sweep all targets every `check_interval` until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) {
        if !self.settings.enabled {
            debug!("reliability monitoring disabled");
            return;
        }

        let period = self.settings.check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = period.as_secs(), "reliability monitoring started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("reliability monitoring stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.perform_sweep(&cancel).await;
                }
            }
        }
    }

    /// Probe every registered target concurrently and wait for all probes.
    pub async fn perform_sweep(&self, cancel: &CancellationToken) {
        let keys: Vec<String> = self.checks.read().await.keys().cloned().collect();
        if keys.is_empty() {
            return;
        }

        let mut sweep = JoinSet::new();
        for key in keys {
            let manager = self.clone();
            let cancel = cancel.clone();
            sweep.spawn(async move {
                manager.probe_check(&key, &cancel).await;
            });
        }

        let mut probes = 0usize;
        while let Some(joined) = sweep.join_next().await {
            probes += 1;
            if let Err(e) = joined {
                warn!(error = %e, "reliability probe task failed");
            }
        }
        debug!(probes, "reliability sweep complete");
    }

    /// Block until `target:port` is `healthy` with a successful latest
    /// probe. Unknown targets are registered as `"generic"`.
    pub async fn wait_for_healthy(
        &self,
        target: &str,
        port: u16,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _timer = OperationTimer::start(&self.metrics, "wait_for_healthy");
        let key = address_key(target, port);

        if self.reliability_status(target, port).await.is_none() {
            self.add_check(target, port, "generic").await;
        }

        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.settings.wait_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let timeout = || ConnectionError::Timeout {
            waiting_for: format!("{key} to become healthy"),
            max_wait,
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ConnectionError::cancelled(format!("wait for {key} to become healthy")));
                }
                _ = &mut deadline => return Err(timeout()),
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = &mut deadline => return Err(timeout()),
                        _ = self.probe_check(&key, cancel) => {}
                    }
                    if cancel.is_cancelled() {
                        return Err(ConnectionError::cancelled(format!("wait for {key} to become healthy")));
                    }

                    let current = self
                        .checks
                        .read()
                        .await
                        .get(&key)
                        .map(|c| (c.status, c.last_probe_succeeded()));
                    match current {
                        Some((ReliabilityStatus::Healthy, true)) => {
                            debug!(%key, "target healthy");
                            return Ok(());
                        }
                        Some((status, _)) => {
                            debug!(%key, %status, "waiting for target to become healthy");
                        }
                        None => {
                            debug!(%key, "check removed while waiting, re-registering");
                            self.add_check(target, port, "generic").await;
                        }
                    }
                }
            }
        }
    }

    /// Probe one registered target and record the outcome.
    ///
    /// The registry lock is released while the probe runs; a target removed
    /// in the meantime is left alone.
    async fn probe_check(&self, key: &str, cancel: &CancellationToken) {
        let Some(snapshot) = self.checks.read().await.get(key).cloned() else {
            return;
        };

        let outcome = self
            .connections
            .test_port_availability(&snapshot.target, snapshot.port, self.settings.probe_timeout, cancel)
            .await;

        let observation = match outcome {
            Ok(()) => Observation::Success,
            Err(e) if e.is_cancelled() => return,
            Err(e) => Observation::Failure(e.to_string()),
        };
        self.apply_observation(key, observation).await;
    }

    /// Apply an externally obtained observation to a registered target.
    ///
    /// Returns the new status, or `None` if the target is not registered.
    pub async fn record_observation(
        &self,
        target: &str,
        port: u16,
        observation: Observation,
    ) -> Option<ReliabilityStatus> {
        self.apply_observation(&address_key(target, port), observation).await
    }

    async fn apply_observation(&self, key: &str, observation: Observation) -> Option<ReliabilityStatus> {
        let success = observation == Observation::Success;

        let mut checks = self.checks.write().await;
        let check = checks.get_mut(key)?;
        let previous = check.status;
        let status = check.observe(observation, &self.settings.thresholds, SystemTime::now());
        drop(checks);

        if success {
            self.metrics.record_value("reliability_check_success", 1.0, "count");
        } else {
            self.metrics.record_value("reliability_check_failure", 1.0, "count");
        }
        if previous != status {
            self.metrics.record_value("reliability_status_transition", 1.0, "count");
        }
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cws_metrics::NoopMetrics;
    use tokio::net::TcpListener;

    fn fast_settings() -> ReliabilitySettings {
        ReliabilitySettings {
            check_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(1),
            wait_poll_interval: Duration::from_millis(50),
            ..ReliabilitySettings::default()
        }
    }

    fn manager() -> ReliabilityManager {
        let metrics = NoopMetrics::shared();
        let connections = Arc::new(ConnectionManager::new(metrics.clone()));
        ReliabilityManager::with_settings(connections, metrics, fast_settings())
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn add_is_idempotent_and_resets() {
        let rm = manager();
        rm.add_check("10.0.0.5", 22, "ssh").await;
        rm.record_observation("10.0.0.5", 22, Observation::Failure("x".into())).await;
        rm.record_observation("10.0.0.5", 22, Observation::Failure("x".into())).await;
        assert_eq!(
            rm.reliability_status("10.0.0.5", 22).await.unwrap().status,
            ReliabilityStatus::Degraded
        );

        rm.add_check("10.0.0.5", 22, "ssh").await;
        let check = rm.reliability_status("10.0.0.5", 22).await.unwrap();
        assert_eq!(check.status, ReliabilityStatus::Healthy);
        assert_eq!(check.consecutive_failures, 0);
        assert_eq!(rm.all_checks().await.len(), 1);

        rm.remove_check("10.0.0.5", 22).await;
        assert!(rm.reliability_status("10.0.0.5", 22).await.is_none());
        assert!(!rm.is_healthy("10.0.0.5", 22).await);
    }

    #[tokio::test]
    async fn observation_for_unknown_target_is_ignored() {
        let rm = manager();
        assert!(rm.record_observation("nowhere", 1, Observation::Success).await.is_none());
    }

    #[tokio::test]
    async fn summary_reports_ratio() {
        let rm = manager();
        for port in 1..=4 {
            rm.add_check("host", port, "generic").await;
        }
        for _ in 0..3 {
            rm.record_observation("host", 1, Observation::Failure("down".into())).await;
        }

        let summary = rm.healthy_summary().await;
        assert_eq!(summary.total_checks, 4);
        assert_eq!(summary.healthy_checks, 3);
        assert!((summary.overall_healthiness - 0.75).abs() < f64::EPSILON);
        assert_eq!(summary.status_counts[&ReliabilityStatus::Unhealthy], 1);
    }

    #[tokio::test]
    async fn empty_summary_is_zero() {
        let summary = manager().healthy_summary().await;
        assert_eq!(summary.total_checks, 0);
        assert_eq!(summary.overall_healthiness, 0.0);
    }

    #[tokio::test]
    async fn sweep_probes_every_target() {
        let rm = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        rm.add_check("127.0.0.1", open, "generic").await;
        rm.add_check("127.0.0.1", closed, "generic").await;

        let cancel = CancellationToken::new();
        for _ in 0..3 {
            rm.perform_sweep(&cancel).await;
        }

        let up = rm.reliability_status("127.0.0.1", open).await.unwrap();
        assert_eq!(up.status, ReliabilityStatus::Healthy);
        assert_eq!(up.total_checks, 3);
        assert_eq!(up.success_rate, 1.0);

        let down = rm.reliability_status("127.0.0.1", closed).await.unwrap();
        assert_eq!(down.status, ReliabilityStatus::Unhealthy);
        assert_eq!(down.consecutive_failures, 3);
        assert!(down.error_message.is_some());
    }

    #[tokio::test]
    async fn wait_for_healthy_registers_generic() {
        let rm = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        rm.wait_for_healthy("127.0.0.1", port, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        let check = rm.reliability_status("127.0.0.1", port).await.unwrap();
        assert_eq!(check.service, "generic");
        assert_eq!(check.status, ReliabilityStatus::Healthy);
    }

    #[tokio::test]
    async fn wait_for_healthy_times_out_on_closed_port() {
        let rm = manager();
        let port = closed_port().await;

        let err = rm
            .wait_for_healthy("127.0.0.1", port, Duration::from_millis(300), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn start_stops_on_cancel() {
        let rm = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        rm.add_check("127.0.0.1", port, "generic").await;

        let cancel = CancellationToken::new();
        let runner = rm.clone();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { runner.start(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor loop did not stop")
            .unwrap();

        let check = rm.reliability_status("127.0.0.1", port).await.unwrap();
        assert!(check.total_checks >= 1);
    }

    #[tokio::test]
    async fn disabled_manager_returns_immediately() {
        let metrics = NoopMetrics::shared();
        let connections = Arc::new(ConnectionManager::new(metrics.clone()));
        let rm = ReliabilityManager::with_settings(
            connections,
            metrics,
            ReliabilitySettings {
                enabled: false,
                ..fast_settings()
            },
        );
        tokio::time::timeout(Duration::from_millis(100), rm.start(CancellationToken::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recorded_observations_feed_metrics() {
        let monitor = Arc::new(cws_metrics::PerformanceMonitor::new());
        let connections = Arc::new(ConnectionManager::new(monitor.clone()));
        let rm = ReliabilityManager::with_settings(connections, monitor.clone(), fast_settings());
        rm.add_check("10.0.0.5", 22, "ssh").await;

        for _ in 0..3 {
            rm.record_observation("10.0.0.5", 22, Observation::Failure("refused".into())).await;
        }
        let status = rm.record_observation("10.0.0.5", 22, Observation::Success).await;
        assert_eq!(status, Some(ReliabilityStatus::Unhealthy));
        let status = rm.record_observation("10.0.0.5", 22, Observation::Success).await;
        assert_eq!(status, Some(ReliabilityStatus::Recovering));

        assert_eq!(monitor.count("reliability_check_failure"), 3);
        assert_eq!(monitor.count("reliability_check_success"), 2);
        // Healthy -> Degraded -> Unhealthy -> Recovering
        assert_eq!(monitor.count("reliability_status_transition"), 3);

        assert!(rm.record_observation("nowhere", 1, Observation::Success).await.is_none());
        assert_eq!(monitor.count("reliability_check_success"), 2);
    }

    #[tokio::test]
    async fn sweep_takes_as_long_as_its_slowest_probe() {
        let metrics = NoopMetrics::shared();
        let connections = Arc::new(ConnectionManager::new(metrics.clone()));
        let probe_timeout = Duration::from_millis(400);
        let rm = ReliabilityManager::with_settings(
            connections,
            metrics,
            ReliabilitySettings {
                probe_timeout,
                ..fast_settings()
            },
        );

        // Non-routable: each probe either hangs until the timeout or fails at once.
        for port in [81, 82, 83, 84] {
            rm.add_check("10.255.255.1", port, "generic").await;
        }

        let started = std::time::Instant::now();
        rm.perform_sweep(&CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(elapsed < probe_timeout * 2, "sweep ran probes one after another: {elapsed:?}");
        for check in rm.all_checks().await.values() {
            assert_eq!(check.total_checks, 1);
            assert!(!check.last_probe_succeeded());
        }
    }
}

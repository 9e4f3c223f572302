//! Cross-component reliability flows.
//!
//! Exercises the reliability manager, daemon façade and metrics monitor
//! together against real local listeners.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use cws_connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, DaemonConnectionManager, DaemonSettings,
    ReliabilityManager, ReliabilitySettings, ReliabilityStatus,
};
use cws_metrics::{NoopMetrics, PerformanceMonitor, SharedMetrics, render_prometheus};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn fast_reliability() -> ReliabilitySettings {
    ReliabilitySettings {
        check_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_secs(1),
        wait_poll_interval: Duration::from_millis(50),
        ..ReliabilitySettings::default()
    }
}

fn reliability(metrics: SharedMetrics) -> ReliabilityManager {
    let connections = Arc::new(ConnectionManager::new(metrics.clone()));
    ReliabilityManager::with_settings(connections, metrics, fast_reliability())
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn wait_for_healthy_sees_target_that_comes_up_late() {
    let monitor = Arc::new(PerformanceMonitor::new());
    let rm = reliability(monitor.clone());
    let port = free_port().await;

    // The target only starts listening after several failed probe cycles.
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        loop {
            let _ = listener.accept().await;
        }
    });

    rm.wait_for_healthy("127.0.0.1", port, Duration::from_secs(10), &CancellationToken::new())
        .await
        .unwrap();

    let check = rm.reliability_status("127.0.0.1", port).await.unwrap();
    assert_eq!(check.status, ReliabilityStatus::Healthy);
    assert!(check.total_checks > 1);
    assert!(check.last_failure.is_some());
    assert!(monitor.count("reliability_check_failure") >= 1);
    assert!(monitor.count("reliability_check_success") >= 1);

    server.abort();
}

#[tokio::test]
async fn cancelling_a_wait_returns_before_next_poll() {
    let metrics = NoopMetrics::shared();
    let connections = Arc::new(ConnectionManager::new(metrics.clone()));
    // Default five second poll interval.
    let rm = ReliabilityManager::new(connections, metrics);
    let port = free_port().await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = rm
        .wait_for_healthy("127.0.0.1", port, Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn summary_tracks_mixed_registry() {
    let rm = reliability(NoopMetrics::shared());
    let up = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = up.local_addr().unwrap().port();
    let down_a = free_port().await;
    let down_b = free_port().await;

    rm.add_check("127.0.0.1", up_port, "generic").await;
    rm.add_check("127.0.0.1", down_a, "generic").await;
    rm.add_check("127.0.0.1", down_b, "generic").await;

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        rm.perform_sweep(&cancel).await;
    }

    let summary = rm.healthy_summary().await;
    assert_eq!(summary.total_checks, 3);
    assert_eq!(summary.healthy_checks, 1);
    assert!((summary.overall_healthiness - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(summary.status_counts[&ReliabilityStatus::Unhealthy], 2);
}

#[tokio::test]
async fn daemon_round_trip_records_metrics() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let app = Router::new()
            .route("/api/v1/health", get(|| async { "ok" }))
            .route("/api/v1/instances", get(|| async { (StatusCode::OK, "[]") }));
        axum::serve(listener, app).await.unwrap();
    });
    let base = format!("http://{addr}");

    let monitor = Arc::new(PerformanceMonitor::new());
    let settings = DaemonSettings {
        reliability: fast_reliability(),
        ..DaemonSettings::default()
    };
    let daemon = DaemonConnectionManager::with_settings(&base, monitor.clone(), settings)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    daemon.wait_for_daemon(Duration::from_secs(5), &cancel).await.unwrap();
    assert!(daemon.is_healthy().await);

    let request = http::Request::get(format!("{base}/api/v1/instances"))
        .body(Bytes::new())
        .unwrap();
    let response = daemon.make_request_with_retry(&request, &cancel).await.unwrap();
    assert_eq!(response.body().as_ref(), b"[]");

    let stats = daemon.connection_stats().await;
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["is_healthy"], true);
    assert_eq!(json["daemon_url"], base.as_str());
    assert_eq!(json["reliability_stats"]["total_checks"], 1);

    let exposition = render_prometheus(&monitor.metrics());
    assert!(exposition.contains("cws_operation_duration_ms{operation=\"daemon_wait\"}"));
    assert!(exposition.contains("cws_operation_duration_ms{operation=\"daemon_request_with_retry\"}"));
    assert!(exposition.contains("cws_daemon_health_checks_success{unit=\"count\"}"));
}

#[tokio::test]
async fn config_drives_managers() {
    let config = ConnectionConfig::from_toml_str(
        r#"
[retry]
max_retries = 1
base_delay = "10ms"
jitter = false

[reliability]
unhealthy_threshold = 2
"#,
    )
    .unwrap();

    let metrics = NoopMetrics::shared();
    let connections = Arc::new(ConnectionManager::with_policy(
        metrics.clone(),
        config.retry_policy().unwrap(),
    ));
    let port = free_port().await;

    let err = connections
        .connect_with_retry("127.0.0.1", port, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::RetriesExhausted { attempts: 2, .. }), "{err}");

    let rm = ReliabilityManager::with_settings(
        connections,
        metrics,
        config.reliability_settings().unwrap(),
    );
    rm.add_check("127.0.0.1", port, "generic").await;
    let cancel = CancellationToken::new();
    rm.perform_sweep(&cancel).await;
    rm.perform_sweep(&cancel).await;
    assert!(!rm.is_healthy("127.0.0.1", port).await);
    assert_eq!(
        rm.reliability_status("127.0.0.1", port).await.unwrap().status,
        ReliabilityStatus::Unhealthy
    );
}

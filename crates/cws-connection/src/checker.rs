//! HTTP endpoint reliability probe.
//!
//! Unlike [`ConnectionManager::health_check_http`](crate::ConnectionManager::health_check_http),
//! which targets `host:port/path`, this checker accepts any absolute URL
//! and treats redirects as healthy.

use std::time::{Duration, Instant, SystemTime};

use cws_metrics::{OperationTimer, SharedMetrics};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectionError, Result};
use crate::http::HttpClient;
use crate::types::HealthResult;

/// Default timeout of an endpoint probe.
pub const ENDPOINT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes arbitrary HTTP endpoints.
#[derive(Clone)]
pub struct HttpReliabilityChecker {
    http: HttpClient,
    metrics: SharedMetrics,
}

impl HttpReliabilityChecker {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self::with_timeout(metrics, ENDPOINT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(metrics: SharedMetrics, timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(timeout),
            metrics,
        }
    }

    /// GET `url`. 2xx and 3xx are healthy; any other status is a protocol
    /// failure and transport errors are returned as-is.
    pub async fn check_endpoint(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> (HealthResult, Result<()>) {
        let _timer = OperationTimer::start(&self.metrics, "http_endpoint_check");
        let checked_at = SystemTime::now();
        let started = Instant::now();

        let outcome = match self.http.get(url, cancel).await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => Ok(()),
            Ok(resp) => Err(ConnectionError::Status {
                url: url.to_string(),
                status: resp.status(),
            }),
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(()) => {
                debug!(%url, "endpoint healthy");
                (HealthResult::healthy("http", checked_at, elapsed), outcome)
            }
            Err(e) => {
                debug!(%url, error = %e, "endpoint unhealthy");
                let message = match e {
                    ConnectionError::Status { status, .. } => format!("HTTP {status}"),
                    other => other.to_string(),
                };
                (HealthResult::unhealthy("http", message, checked_at, elapsed), outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::get;
    use cws_metrics::NoopMetrics;

    use crate::types::HealthStatus;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn classifies_statuses() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "ok" }))
                .route("/moved", get(|| async { Redirect::temporary("/ok") }))
                .route("/missing", get(|| async { StatusCode::NOT_FOUND })),
        )
        .await;
        let checker = HttpReliabilityChecker::new(NoopMetrics::shared());
        let cancel = CancellationToken::new();

        let (ok, res) = checker.check_endpoint(&format!("{base}/ok"), &cancel).await;
        assert!(ok.is_healthy());
        assert_eq!(ok.service, "http");
        assert!(res.is_ok());

        let (moved, res) = checker.check_endpoint(&format!("{base}/moved"), &cancel).await;
        assert!(moved.is_healthy());
        assert!(res.is_ok());

        let (missing, res) = checker.check_endpoint(&format!("{base}/missing"), &cancel).await;
        assert_eq!(missing.status, HealthStatus::Unhealthy);
        assert_eq!(missing.error.as_deref(), Some("HTTP 404 Not Found"));
        assert!(res.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker =
            HttpReliabilityChecker::with_timeout(NoopMetrics::shared(), Duration::from_secs(2));
        let (result, res) = checker
            .check_endpoint(&format!("http://127.0.0.1:{port}/"), &CancellationToken::new())
            .await;
        assert!(!result.is_healthy());
        assert!(res.unwrap_err().is_transport());
    }
}

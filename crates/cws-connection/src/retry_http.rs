//! Standalone HTTP client with a fixed retry budget and linear backoff.

use std::time::Duration;

use bytes::Bytes;
use cws_metrics::{OperationTimer, SharedMetrics};
use http::{Request, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConnectionError, Result};
use crate::http::HttpClient;
use crate::policy::linear_backoff;

/// Retry settings for [`RetryableHttpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HttpRetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Attempt `n` is followed by a sleep of `(n + 1) × base_delay`.
    pub base_delay: Duration,
    /// Timeout of each HTTP exchange.
    pub timeout: Duration,
}

impl HttpRetrySettings {
    /// Total number of attempts, `max_retries + 1` saturating at `u32::MAX`.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for HttpRetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client that retries transport failures.
///
/// Only transport failures are retried; any HTTP status is returned to the
/// caller as a response.
#[derive(Clone)]
pub struct RetryableHttpClient {
    http: HttpClient,
    metrics: SharedMetrics,
    settings: HttpRetrySettings,
}

impl RetryableHttpClient {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self::with_settings(metrics, HttpRetrySettings::default())
    }

    pub fn with_settings(metrics: SharedMetrics, settings: HttpRetrySettings) -> Self {
        Self {
            http: HttpClient::new(settings.timeout),
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &HttpRetrySettings {
        &self.settings
    }

    /// Send `request` up to `max_retries + 1` times.
    pub async fn send(
        &self,
        request: &Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Response<Bytes>> {
        let _timer = OperationTimer::start(&self.metrics, "retryable_http_request");
        let attempts = self.settings.total_attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.http.send(request, cancel).await {
                Ok(response) => {
                    self.metrics.record_value("http_request_success", 1.0, "count");
                    if attempt > 0 {
                        debug!(uri = %request.uri(), attempt = attempt + 1, "request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.metrics.record_value("http_request_failure", 1.0, "count");
                    warn!(uri = %request.uri(), attempt = attempt + 1, attempts, error = %e, "HTTP request failed");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                let delay = linear_backoff(self.settings.base_delay, attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(ConnectionError::cancelled(format!("HTTP request to {}", request.uri())));
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
}

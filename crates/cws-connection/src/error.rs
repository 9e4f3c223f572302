//! Error types for the connection reliability core.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors that can occur while connecting, probing, or waiting.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("port {port} not available on {target}: {source}")]
    Dial {
        target: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("port {port} not available on {target}: no answer within {timeout:?}")]
    DialTimeout {
        target: String,
        port: u16,
        timeout: Duration,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("HTTP request to {url} timed out after {timeout:?}")]
    RequestTimeout { url: String, timeout: Duration },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: StatusCode },

    #[error("timeout waiting for {waiting_for} after {max_wait:?}")]
    Timeout {
        waiting_for: String,
        max_wait: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("connection failed after {attempts} attempts to {address}: {last_error}")]
    RetriesExhausted {
        address: String,
        attempts: u32,
        last_error: String,
    },

    #[error("request to {target} failed after {attempts} attempts: {source}")]
    RequestFailed {
        target: String,
        attempts: u32,
        #[source]
        source: Box<ConnectionError>,
    },

    #[error("daemon unavailable at {url}: {source}")]
    DaemonUnavailable {
        url: String,
        #[source]
        source: Box<ConnectionError>,
    },

    #[error("invalid daemon URL {url:?}: {reason}")]
    InvalidDaemonUrl { url: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ConnectionError {
    pub(crate) fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Dial, connect, or HTTP transport failure. Retryable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::DialTimeout { .. } | Self::Http { .. } | Self::RequestTimeout { .. }
        )
    }

    /// The caller's wait budget ran out (the target may still come up).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The caller aborted the operation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::DaemonUnavailable { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The peer answered but with an unhealthy status.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Status { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let dial = ConnectionError::DialTimeout {
            target: "10.0.0.1".into(),
            port: 22,
            timeout: Duration::from_secs(1),
        };
        assert!(dial.is_transport());
        assert!(!dial.is_timeout());

        let wait = ConnectionError::Timeout {
            waiting_for: "port 22 on 10.0.0.1".into(),
            max_wait: Duration::from_secs(30),
        };
        assert!(wait.is_timeout());
        assert!(!wait.is_transport());

        let status = ConnectionError::Status {
            url: "http://localhost:8947/api/v1/health".into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        };
        assert!(status.is_protocol());
        assert!(!status.is_transport());

        let cancelled = ConnectionError::cancelled("port wait");
        assert!(cancelled.is_cancelled());
        let unavailable = ConnectionError::DaemonUnavailable {
            url: "http://localhost:8947".into(),
            source: Box::new(cancelled),
        };
        assert!(unavailable.is_cancelled());
    }

    #[test]
    fn aggregate_messages_name_target_and_attempts() {
        let err = ConnectionError::RetriesExhausted {
            address: "127.0.0.1:9".into(),
            attempts: 4,
            last_error: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("127.0.0.1:9"));

        let wait = ConnectionError::Timeout {
            waiting_for: "port 22 on host".into(),
            max_wait: Duration::from_secs(30),
        };
        assert_eq!(wait.to_string(), "timeout waiting for port 22 on host after 30s");
    }
}

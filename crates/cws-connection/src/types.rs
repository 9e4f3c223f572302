//! Records produced and tracked by the connection managers.
//!
//! Everything here is serializable so callers can hand snapshots straight
//! to JSON output.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;

// ── Connections ────────────────────────────────────────────────────

/// Status of the most recent connection attempt to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connecting,
    Connected,
    Failed,
    Timeout,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Per-address connection record, keyed by `host:port`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub target: String,
    pub status: ConnectionStatus,
    pub attempts: u32,
    pub last_attempt: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<SystemTime>,
}

impl ConnectionState {
    pub(crate) fn pending(address: &str) -> Self {
        Self {
            target: address.to_string(),
            status: ConnectionStatus::Pending,
            attempts: 0,
            last_attempt: None,
            last_error: None,
            next_retry: None,
        }
    }
}

/// Evidence of a successful connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionResult {
    pub address: String,
    pub connected: bool,
    /// Time taken by the successful dial.
    pub latency: Duration,
}

/// Snapshot of every tracked address grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub connections_by_status: HashMap<ConnectionStatus, usize>,
}

// ── One-shot health probes ─────────────────────────────────────────

/// Outcome class of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Result of a one-shot health probe. Produced, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResult {
    pub service: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: SystemTime,
    pub duration: Duration,
}

impl HealthResult {
    pub(crate) fn healthy(service: impl Into<String>, checked_at: SystemTime, duration: Duration) -> Self {
        Self {
            service: service.into(),
            status: HealthStatus::Healthy,
            error: None,
            checked_at,
            duration,
        }
    }

    pub(crate) fn unhealthy(
        service: impl Into<String>,
        error: impl Into<String>,
        checked_at: SystemTime,
        duration: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            status: HealthStatus::Unhealthy,
            error: Some(error.into()),
            checked_at,
            duration,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

// ── Reliability ────────────────────────────────────────────────────

/// Hysteretic health classification of a monitored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Recovering,
}

impl fmt::Display for ReliabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

/// Aggregate view over a reliability registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReliabilitySummary {
    pub total_checks: usize,
    pub healthy_checks: usize,
    /// `healthy_checks / total_checks`, or 0 for an empty registry.
    pub overall_healthiness: f64,
    pub status_counts: HashMap<ReliabilityStatus, usize>,
}

/// Key used by both registries: `host:port`.
pub(crate) fn address_key(target: &str, port: u16) -> String {
    format!("{target}:{port}")
}

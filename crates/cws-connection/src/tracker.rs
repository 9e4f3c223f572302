//! Per-target reliability record and its hysteretic state machine.
//!
//! Entering `Unhealthy` takes `unhealthy_threshold` consecutive failures.
//! Leaving it takes `recovery_threshold` successes to reach `Recovering`
//! and `2 × recovery_threshold` to reach `Healthy` again. A single isolated
//! failure never moves a target out of `Healthy`.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::types::ReliabilityStatus;

/// Number of recent observations used for `success_rate`.
pub const SUCCESS_WINDOW: usize = 100;

/// Thresholds driving the reliability state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthThresholds {
    /// Consecutive failures before a target is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes per recovery stage.
    pub recovery_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// Outcome of a single reliability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Success,
    Failure(String),
}

/// Reliability record for one monitored `target:port`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliabilityCheck {
    pub target: String,
    pub port: u16,
    pub service: String,
    pub status: ReliabilityStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    /// Successes over the last [`SUCCESS_WINDOW`] observations.
    pub success_rate: f64,
    pub last_check: Option<SystemTime>,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Ring buffer of recent outcomes (`true` = success).
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl ReliabilityCheck {
    /// A fresh record. New targets start out `Healthy`.
    pub fn new(target: &str, port: u16, service: &str) -> Self {
        Self {
            target: target.to_string(),
            port,
            service: service.to_string(),
            status: ReliabilityStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            success_rate: 0.0,
            last_check: None,
            last_success: None,
            last_failure: None,
            error_message: None,
            recent: VecDeque::with_capacity(SUCCESS_WINDOW),
        }
    }

    /// Registry key for this record.
    pub fn key(&self) -> String {
        crate::types::address_key(&self.target, self.port)
    }

    /// Apply one observation and return the resulting status.
    pub fn observe(
        &mut self,
        observation: Observation,
        thresholds: &HealthThresholds,
        at: SystemTime,
    ) -> ReliabilityStatus {
        self.last_check = Some(at);
        self.total_checks += 1;

        let previous = self.status;
        match observation {
            Observation::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.last_success = Some(at);
                self.error_message = None;
                self.push_recent(true);

                let recovery = thresholds.recovery_threshold;
                match self.status {
                    ReliabilityStatus::Unhealthy => {
                        if self.consecutive_successes >= recovery {
                            self.status = ReliabilityStatus::Recovering;
                        }
                    }
                    ReliabilityStatus::Recovering => {
                        if self.consecutive_successes >= recovery.saturating_mul(2) {
                            self.status = ReliabilityStatus::Healthy;
                        }
                    }
                    ReliabilityStatus::Healthy | ReliabilityStatus::Degraded => {
                        self.status = ReliabilityStatus::Healthy;
                    }
                }
            }
            Observation::Failure(error) => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.last_failure = Some(at);
                self.error_message = Some(error);
                self.push_recent(false);

                if self.consecutive_failures >= thresholds.unhealthy_threshold {
                    self.status = ReliabilityStatus::Unhealthy;
                } else if self.consecutive_failures > 1 {
                    self.status = ReliabilityStatus::Degraded;
                }
            }
        }

        if previous != self.status {
            match self.status {
                ReliabilityStatus::Unhealthy => warn!(
                    host = %self.target,
                    port = self.port,
                    failures = self.consecutive_failures,
                    "target marked unhealthy"
                ),
                status => debug!(
                    host = %self.target,
                    port = self.port,
                    from = %previous,
                    to = %status,
                    "reliability status changed"
                ),
            }
        }

        self.status
    }

    fn push_recent(&mut self, success: bool) {
        if self.recent.len() == SUCCESS_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
        let successes = self.recent.iter().filter(|ok| **ok).count();
        self.success_rate = successes as f64 / self.recent.len() as f64;
    }

    /// Whether the latest observation succeeded.
    pub fn last_probe_succeeded(&self) -> bool {
        self.recent.back().copied().unwrap_or(false)
    }
}

//! TOML configuration for the connection managers.
//!
//! Every field is optional; missing fields fall back to the built-in
//! defaults. Durations are human strings: `"500ms"`, `"30s"`, `"2m"`, or a
//! bare number of seconds.
//!
//! ```toml
//! [retry]
//! max_retries = 5
//! base_delay = "250ms"
//!
//! [reliability]
//! check_interval = "15s"
//!
//! [daemon]
//! url = "http://localhost:8947"
//!
//! [[targets]]
//! host = "10.0.0.5"
//! port = 22
//! service = "ssh"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::daemon::{DEFAULT_DAEMON_URL, DaemonSettings};
use crate::policy::RetryPolicy;
use crate::reliability::ReliabilitySettings;
use crate::retry_http::HttpRetrySettings;
use crate::tracker::HealthThresholds;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub retry: Option<RetryConfig>,
    pub reliability: Option<ReliabilityConfig>,
    pub daemon: Option<DaemonConfig>,
    pub http: Option<HttpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub base_delay: Option<String>,
    pub max_delay: Option<String>,
    pub multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    pub check_interval: Option<String>,
    pub probe_timeout: Option<String>,
    pub wait_poll_interval: Option<String>,
    pub unhealthy_threshold: Option<u32>,
    pub recovery_threshold: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub url: Option<String>,
    pub health_interval: Option<String>,
    pub request_timeout: Option<String>,
    pub recovery_wait: Option<String>,
    pub request_attempts: Option<u32>,
    pub request_backoff: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    pub max_retries: Option<u32>,
    pub base_delay: Option<String>,
    pub timeout: Option<String>,
}

/// A target monitored by `cwsprobe monitor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub service: Option<String>,
}

impl TargetConfig {
    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or("generic")
    }
}

impl ConnectionConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ConnectionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.retry_policy()?;
        self.reliability_settings()?;
        self.daemon_settings()?;
        self.http_retry_settings()?;
        for target in &self.targets {
            if target.host.trim().is_empty() {
                bail!("target with port {} has an empty host", target.port);
            }
        }
        Ok(())
    }

    /// Connection retry policy from `[retry]`.
    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        let defaults = RetryPolicy::default();
        let Some(retry) = &self.retry else {
            return Ok(defaults);
        };

        let multiplier = retry.multiplier.unwrap_or(defaults.multiplier);
        if !multiplier.is_finite() || multiplier < 1.0 {
            bail!("retry.multiplier must be a finite number >= 1.0, got {multiplier}");
        }

        Ok(RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            base_delay: duration_field("retry.base_delay", &retry.base_delay, defaults.base_delay)?,
            max_delay: duration_field("retry.max_delay", &retry.max_delay, defaults.max_delay)?,
            multiplier,
            jitter: retry.jitter.unwrap_or(defaults.jitter),
        })
    }

    /// Reliability monitoring settings from `[reliability]`.
    pub fn reliability_settings(&self) -> anyhow::Result<ReliabilitySettings> {
        let defaults = ReliabilitySettings::default();
        let Some(rel) = &self.reliability else {
            return Ok(defaults);
        };

        let thresholds = HealthThresholds {
            unhealthy_threshold: rel
                .unhealthy_threshold
                .unwrap_or(defaults.thresholds.unhealthy_threshold),
            recovery_threshold: rel
                .recovery_threshold
                .unwrap_or(defaults.thresholds.recovery_threshold),
        };
        if thresholds.unhealthy_threshold == 0 || thresholds.recovery_threshold == 0 {
            bail!("reliability thresholds must be at least 1");
        }

        Ok(ReliabilitySettings {
            check_interval: nonzero_duration_field(
                "reliability.check_interval",
                &rel.check_interval,
                defaults.check_interval,
            )?,
            probe_timeout: nonzero_duration_field(
                "reliability.probe_timeout",
                &rel.probe_timeout,
                defaults.probe_timeout,
            )?,
            wait_poll_interval: nonzero_duration_field(
                "reliability.wait_poll_interval",
                &rel.wait_poll_interval,
                defaults.wait_poll_interval,
            )?,
            thresholds,
            enabled: rel.enabled.unwrap_or(defaults.enabled),
        })
    }

    /// Daemon base URL from `[daemon]`.
    pub fn daemon_url(&self) -> &str {
        self.daemon
            .as_ref()
            .and_then(|d| d.url.as_deref())
            .unwrap_or(DEFAULT_DAEMON_URL)
    }

    /// Daemon settings from `[daemon]`, combined with `[retry]` and
    /// `[reliability]`.
    pub fn daemon_settings(&self) -> anyhow::Result<DaemonSettings> {
        let defaults = DaemonSettings::default();
        let daemon = self.daemon.clone().unwrap_or_default();

        Ok(DaemonSettings {
            health_interval: nonzero_duration_field(
                "daemon.health_interval",
                &daemon.health_interval,
                defaults.health_interval,
            )?,
            request_timeout: nonzero_duration_field(
                "daemon.request_timeout",
                &daemon.request_timeout,
                defaults.request_timeout,
            )?,
            recovery_wait: duration_field(
                "daemon.recovery_wait",
                &daemon.recovery_wait,
                defaults.recovery_wait,
            )?,
            request_attempts: daemon.request_attempts.unwrap_or(defaults.request_attempts),
            request_backoff: duration_field(
                "daemon.request_backoff",
                &daemon.request_backoff,
                defaults.request_backoff,
            )?,
            retry: self.retry_policy()?,
            reliability: self.reliability_settings()?,
        })
    }

    /// Standalone HTTP retry settings from `[http]`.
    pub fn http_retry_settings(&self) -> anyhow::Result<HttpRetrySettings> {
        let defaults = HttpRetrySettings::default();
        let Some(http) = &self.http else {
            return Ok(defaults);
        };

        Ok(HttpRetrySettings {
            max_retries: http.max_retries.unwrap_or(defaults.max_retries),
            base_delay: duration_field("http.base_delay", &http.base_delay, defaults.base_delay)?,
            timeout: duration_field("http.timeout", &http.timeout, defaults.timeout)?,
        })
    }
}

fn duration_field(field: &str, value: &Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => match parse_duration(raw) {
            Some(d) => Ok(d),
            None => bail!("{field}: invalid duration {raw:?}"),
        },
    }
}

fn nonzero_duration_field(
    field: &str,
    value: &Option<String>,
    default: Duration,
) -> anyhow::Result<Duration> {
    let d = duration_field(field, value, default)?;
    if d.is_zero() {
        bail!("{field} must be greater than zero");
    }
    Ok(d)
}

/// Parse a duration string like "5s", "500ms", "2m", or "10" (seconds).
/// Values that overflow `u64` seconds are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled_secs(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled_secs(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn scaled_secs(value: &str, unit: u64) -> Option<Duration> {
    let n = value.trim().parse::<u64>().ok()?;
    n.checked_mul(unit).map(Duration::from_secs)
}

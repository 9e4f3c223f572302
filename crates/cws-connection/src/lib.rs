//! cws-connection — connection reliability for CloudWorkstation.
//!
//! Establishes, probes, and continuously monitors network endpoints under
//! transient failure: the local control-plane daemon and arbitrary TCP or
//! HTTP services.
//!
//! # Architecture
//!
//! ```text
//! DaemonConnectionManager
//!   ├── ReliabilityManager
//!   │   ├── ReliabilityCheck per target (hysteretic state machine)
//!   │   └── periodic JoinSet sweep → ConnectionManager::test_port_availability
//!   ├── ConnectionManager
//!   │   ├── connect_with_retry (exponential backoff + jitter)
//!   │   ├── port probes, SSH/HTTP health checks
//!   │   └── per-address ConnectionState map
//!   └── make_request_with_retry (wait for daemon, linear backoff)
//!
//! RetryableHttpClient        standalone, linear backoff
//! HttpReliabilityChecker     one-shot probe of any URL
//! ```
//!
//! # Cancellation
//!
//! Every blocking operation takes a `CancellationToken`. Cancelling it makes
//! sleeps, polls, dials and HTTP exchanges return
//! [`ConnectionError::Cancelled`] promptly instead of at the next tick.
//!
//! # Metrics
//!
//! Operation timings and counters go to a [`cws_metrics::Metrics`]
//! implementation; pass [`cws_metrics::NoopMetrics`] to discard them.

pub mod checker;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod manager;
pub mod policy;
pub mod reliability;
pub mod retry_http;
pub mod tracker;
pub mod types;

pub use checker::HttpReliabilityChecker;
pub use config::{ConnectionConfig, TargetConfig, parse_duration};
pub use daemon::{DaemonConnectionManager, DaemonConnectionStats, DaemonEndpoint, DaemonSettings, parse_daemon_url};
pub use error::{ConnectionError, Result};
pub use manager::{ConnectionManager, SharedConnectionManager};
pub use policy::RetryPolicy;
pub use reliability::{ReliabilityManager, ReliabilitySettings};
pub use retry_http::{HttpRetrySettings, RetryableHttpClient};
pub use tracker::{HealthThresholds, Observation, ReliabilityCheck};
pub use types::{
    ConnectionResult, ConnectionState, ConnectionStats, ConnectionStatus, HealthResult, HealthStatus,
    ReliabilityStatus, ReliabilitySummary,
};

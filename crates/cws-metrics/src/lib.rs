//! cws-metrics — observability hooks for the connection reliability core.
//!
//! The reliability core only talks to the [`Metrics`] trait: it starts
//! named timed operations and records named numeric observations. How
//! those are stored is up to the implementation.
//!
//! # Architecture
//!
//! ```text
//! Metrics (trait)
//!   ├── record_timing() ← OperationTimer::end() / drop
//!   └── record_value()  ← counters and gauges
//!
//! PerformanceMonitor (in-memory Metrics impl)
//!   ├── metric() / metrics() → MetricSample snapshots
//!   └── summary() → PerformanceSummary
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod monitor;
pub mod prometheus;
pub mod recorder;

pub use monitor::{DataPoint, MetricSample, PerformanceMonitor, PerformanceSummary};
pub use prometheus::render_prometheus;
pub use recorder::{Metrics, NoopMetrics, OperationTimer, SharedMetrics};

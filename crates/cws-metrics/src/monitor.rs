//! In-memory performance monitor.
//!
//! Keeps the latest value and a bounded history for every named metric.
//! Operation timings are stored under `timing_<operation>` in milliseconds.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::trace;

use crate::recorder::Metrics;

/// Number of data points retained per metric.
pub const HISTORY_LIMIT: usize = 100;

const TIMING_PREFIX: &str = "timing_";

/// A point-in-time measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: SystemTime,
    pub value: f64,
}

/// Snapshot of one named metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub last_updated: SystemTime,
    pub history: Vec<DataPoint>,
}

impl MetricSample {
    fn new(name: &str, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 0.0,
            unit: unit.to_string(),
            last_updated: SystemTime::now(),
            history: Vec::new(),
        }
    }

    fn push(&mut self, value: f64) {
        let now = SystemTime::now();
        self.value = value;
        self.last_updated = now;
        self.history.push(DataPoint {
            timestamp: now,
            value,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Sum of all retained history values.
    pub fn history_total(&self) -> f64 {
        self.history.iter().map(|p| p.value).sum()
    }
}

/// High-level overview of what the monitor has seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub uptime: Duration,
    pub metric_count: usize,
    /// Average duration (ms) per timed operation over the retained history.
    pub operation_timings: HashMap<String, f64>,
}

/// [`Metrics`] implementation that keeps everything in memory.
pub struct PerformanceMonitor {
    metrics: RwLock<HashMap<String, MetricSample>>,
    started: Instant,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    fn record(&self, name: &str, value: f64, unit: &str) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics
            .entry(name.to_string())
            .or_insert_with(|| MetricSample::new(name, unit))
            .push(value);
        trace!(metric = %name, value, unit, "metric recorded");
    }

    /// Snapshot a single metric.
    pub fn metric(&self, name: &str) -> Option<MetricSample> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        metrics.get(name).cloned()
    }

    /// Snapshot every metric, sorted by name.
    pub fn metrics(&self) -> Vec<MetricSample> {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<MetricSample> = metrics.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of observations recorded under `name` (bounded by the history).
    pub fn count(&self, name: &str) -> usize {
        self.metric(name).map(|m| m.history.len()).unwrap_or(0)
    }

    /// Summarize uptime and average operation timings.
    pub fn summary(&self) -> PerformanceSummary {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());

        let operation_timings = metrics
            .iter()
            .filter_map(|(name, m)| {
                let op = name.strip_prefix(TIMING_PREFIX)?;
                if m.history.is_empty() {
                    return None;
                }
                Some((op.to_string(), m.history_total() / m.history.len() as f64))
            })
            .collect();

        PerformanceSummary {
            uptime: self.started.elapsed(),
            metric_count: metrics.len(),
            operation_timings,
        }
    }
}

impl Metrics for PerformanceMonitor {
    fn record_timing(&self, operation: &str, elapsed: Duration) {
        let name = format!("{TIMING_PREFIX}{operation}");
        self.record(&name, elapsed.as_secs_f64() * 1000.0, "milliseconds");
    }

    fn record_value(&self, name: &str, value: f64, unit: &str) {
        self.record(name, value, unit);
    }
}

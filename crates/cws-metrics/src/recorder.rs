//! The metrics collaborator interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sink for operation timings and numeric observations.
///
/// Implementations must be cheap to call from hot paths; the connection
/// managers call into this around every network operation.
pub trait Metrics: Send + Sync {
    /// Record how long a named operation took.
    fn record_timing(&self, operation: &str, elapsed: Duration);

    /// Record an arbitrary named value (counter increment, gauge, ...).
    fn record_value(&self, name: &str, value: f64, unit: &str);
}

/// Shared handle to a metrics sink.
pub type SharedMetrics = Arc<dyn Metrics>;

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl NoopMetrics {
    /// A shared no-op sink.
    pub fn shared() -> SharedMetrics {
        Arc::new(NoopMetrics)
    }
}

impl Metrics for NoopMetrics {
    fn record_timing(&self, _operation: &str, _elapsed: Duration) {}

    fn record_value(&self, _name: &str, _value: f64, _unit: &str) {}
}

/// Times a named operation.
///
/// The elapsed time is recorded exactly once: on [`OperationTimer::end`],
/// or when the timer is dropped (so early returns via `?` still count).
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
    metrics: SharedMetrics,
    finished: bool,
}

impl OperationTimer {
    /// Start timing `operation`.
    pub fn start(metrics: &SharedMetrics, operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
            metrics: Arc::clone(metrics),
            finished: false,
        }
    }

    /// Name of the operation being timed.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Stop the timer, record the duration, and return it.
    pub fn end(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.finished {
            self.finished = true;
            self.metrics.record_timing(self.operation, elapsed);
        }
        elapsed
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.finish();
    }
}

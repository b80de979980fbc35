//! Observability infrastructure for the profiler
//!
//! Provides:
//! - Prometheus metrics (capture and sampler latency, tracked processes, history size)
//! - Structured event logging with tracing

use crate::sampler::MetricKind;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ProfilerMetricsInner> = OnceLock::new();

struct ProfilerMetricsInner {
    capture_latency_seconds: Histogram,
    sampler_latency_seconds: HistogramVec,
    tracked_processes: IntGauge,
    history_records: IntGauge,
    history_version: IntGauge,
    capture_errors: IntCounter,
    sampler_errors: IntCounterVec,
    persistence_errors: IntCounter,
}

impl ProfilerMetricsInner {
    fn new() -> Self {
        Self {
            capture_latency_seconds: register_histogram!(
                "process_profiler_capture_latency_seconds",
                "Time spent assembling one capture cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register capture_latency_seconds"),

            sampler_latency_seconds: register_histogram_vec!(
                "process_profiler_sampler_latency_seconds",
                "Time spent in one sampler cycle",
                &["metric"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sampler_latency_seconds"),

            tracked_processes: register_int_gauge!(
                "process_profiler_tracked_processes",
                "Number of processes currently tracked"
            )
            .expect("Failed to register tracked_processes"),

            history_records: register_int_gauge!(
                "process_profiler_history_records",
                "Number of records retained in history"
            )
            .expect("Failed to register history_records"),

            history_version: register_int_gauge!(
                "process_profiler_history_version",
                "Current history version"
            )
            .expect("Failed to register history_version"),

            capture_errors: register_int_counter!(
                "process_profiler_capture_errors_total",
                "Capture cycles that failed and were skipped"
            )
            .expect("Failed to register capture_errors"),

            sampler_errors: register_int_counter_vec!(
                "process_profiler_sampler_errors_total",
                "Counter query failures per metric",
                &["metric"]
            )
            .expect("Failed to register sampler_errors"),

            persistence_errors: register_int_counter!(
                "process_profiler_persistence_errors_total",
                "Failed writes to the history log"
            )
            .expect("Failed to register persistence_errors"),
        }
    }
}

/// Handle to the global profiler metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ProfilerMetrics {
    _private: (),
}

impl Default for ProfilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ProfilerMetricsInner {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new)
    }

    pub fn observe_capture_latency(&self, duration_secs: f64) {
        self.inner().capture_latency_seconds.observe(duration_secs);
    }

    pub fn observe_sampler_latency(&self, kind: MetricKind, duration_secs: f64) {
        self.inner()
            .sampler_latency_seconds
            .with_label_values(&[kind.as_str()])
            .observe(duration_secs);
    }

    pub fn set_tracked_processes(&self, count: i64) {
        self.inner().tracked_processes.set(count);
    }

    pub fn set_history(&self, records: i64, version: i64) {
        self.inner().history_records.set(records);
        self.inner().history_version.set(version);
    }

    pub fn inc_capture_errors(&self) {
        self.inner().capture_errors.inc();
    }

    pub fn add_sampler_errors(&self, kind: MetricKind, count: u64) {
        self.inner()
            .sampler_errors
            .with_label_values(&[kind.as_str()])
            .inc_by(count);
    }

    pub fn inc_persistence_errors(&self) {
        self.inner().persistence_errors.inc();
    }
}

/// Structured logger for profiler lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    target_name: String,
}

impl StructuredLogger {
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, tracked: usize) {
        info!(
            event = "profiler_started",
            target_name = %self.target_name,
            profiler_version = %version,
            tracked_processes = tracked,
            "Process profiler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "profiler_shutdown",
            target_name = %self.target_name,
            reason = %reason,
            "Process profiler shutting down"
        );
    }

    pub fn log_process_change(&self, added: &[u32], removed: &[u32]) {
        info!(
            event = "process_set_changed",
            target_name = %self.target_name,
            added = ?added,
            removed = ?removed,
            "Tracked process set changed"
        );
    }

    pub fn log_history_reset(&self, version: u64, records: usize) {
        info!(
            event = "history_reset",
            target_name = %self.target_name,
            version = version,
            records = records,
            "History replaced"
        );
    }

    pub fn log_persistence_failure(&self, path: &str, error: &str) {
        warn!(
            event = "persistence_failed",
            target_name = %self.target_name,
            path = %path,
            error = %error,
            "Failed to append capture to history log"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiler_metrics_observe() {
        // Global registry; handles share one set of metrics
        let metrics = ProfilerMetrics::new();
        let other = ProfilerMetrics::new();

        metrics.observe_capture_latency(0.001);
        metrics.observe_sampler_latency(MetricKind::Cpu, 0.002);
        metrics.set_tracked_processes(3);
        metrics.set_history(10, 1);
        other.add_sampler_errors(MetricKind::Gpu, 2);
        other.inc_capture_errors();
        other.inc_persistence_errors();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("game");
        assert_eq!(logger.target_name, "game");
    }
}

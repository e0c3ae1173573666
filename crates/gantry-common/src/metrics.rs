//! Metrics registry for Gantry observability
//!
//! Provides OpenTelemetry metrics for:
//! - Runner population (count by state)
//! - Reconciliation (duration, error counts)
//! - Dispatch service calls (result counts)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for Gantry metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("gantry"));

// ============================================================================
// Runner Population Metrics
// ============================================================================

/// Gauge tracking runners by state
///
/// Labels:
/// - `runner_set`: runner set name
/// - `state`: pending, running, failed
pub static RUNNERS_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("gantry_ephemeral_runners")
        .with_description("Number of ephemeral runners by state")
        .with_unit("{runners}")
        .build()
});

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of runner-set reconciliation duration
///
/// Labels:
/// - `runner_set`: runner set name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gantry_runnerset_reconcile_duration_seconds")
        .with_description("Duration of runner-set reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of runner-set reconciliation errors
///
/// Labels:
/// - `runner_set`: runner set name
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_runnerset_reconcile_errors_total")
        .with_description("Total number of runner-set reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Dispatch Service Metrics
// ============================================================================

/// Counter of dispatch service deregistration calls
///
/// Labels:
/// - `result`: success, not_found, transient, permanent
pub static DISPATCH_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gantry_dispatch_requests_total")
        .with_description("Total number of dispatch service deregistration calls")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Labels for the runner state gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Awaiting registration with the dispatch service
    Pending,
    /// Pod up, idle or executing a job
    Running,
    /// Exited with an error
    Failed,
}

impl RunnerState {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a runner-set reconciliation with timing
pub struct ReconcileTimer {
    runner_set: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(runner_set: impl Into<String>) -> Self {
        Self {
            runner_set: runner_set.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("runner_set", self.runner_set),
                opentelemetry::KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("runner_set", self.runner_set.clone()),
                opentelemetry::KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                opentelemetry::KeyValue::new("runner_set", self.runner_set),
                opentelemetry::KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

/// Update the runner state gauge for one runner set
pub fn set_runner_state_count(runner_set: &str, state: RunnerState, count: i64) {
    RUNNERS_TOTAL.record(
        count,
        &[
            opentelemetry::KeyValue::new("runner_set", runner_set.to_string()),
            opentelemetry::KeyValue::new("state", state.as_str().to_string()),
        ],
    );
}

/// Record the outcome of a dispatch service call
pub fn record_dispatch_result(result: &str) {
    DISPATCH_REQUESTS.add(
        1,
        &[opentelemetry::KeyValue::new("result", result.to_string())],
    );
}

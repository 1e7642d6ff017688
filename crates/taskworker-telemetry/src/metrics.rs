//! Prometheus metrics for the taskworker
//!
//! Provides metrics for monitoring a worker:
//! - Result counters by status and failure reason
//! - Deadline exceedances
//! - Broker RPC errors by method and code
//! - Child pool and inbound queue gauges
//! - Execution time histogram

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;
use std::time::Instant;

use crate::{TelemetryError, TelemetryResult};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============ Result Counters ============

    /// Results handed to the broker, by status
    pub static ref RESULTS_REPORTED: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_results_reported_total", "Results reported to the broker"),
        &["status"]
    ).expect("metric can be created");

    /// Non-complete results by reason
    pub static ref TASKS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_tasks_failed_total", "Activations that did not complete"),
        &["reason"]
    ).expect("metric can be created");

    /// Activations that ran past their processing deadline
    pub static ref DEADLINE_EXCEEDED: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_deadline_exceeded_total", "Activations that exceeded their processing deadline"),
        &["namespace", "taskname"]
    ).expect("metric can be created");

    /// Results that were never delivered to the broker
    pub static ref RESULTS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_results_dropped_total", "Results dropped without a successful update"),
        &["reason"]
    ).expect("metric can be created");

    // ============ Broker Metrics ============

    /// Failed broker calls
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_rpc_errors_total", "Failed broker RPC calls"),
        &["method", "code"]
    ).expect("metric can be created");

    /// Activations received, by the call that delivered them
    pub static ref TASKS_FETCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("taskworker_tasks_fetched_total", "Activations received from the broker"),
        &["source"]
    ).expect("metric can be created");

    // ============ Pool Metrics ============

    /// Children started, replacements included
    pub static ref CHILDREN_SPAWNED: IntCounter = IntCounter::new(
        "taskworker_children_spawned_total", "Child executors started"
    ).expect("metric can be created");

    /// Children currently running
    pub static ref CHILDREN_LIVE: IntGauge = IntGauge::new(
        "taskworker_children_live", "Child executors currently running"
    ).expect("metric can be created");

    /// Activations waiting for a child
    pub static ref INBOUND_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "taskworker_inbound_queue_depth", "Activations waiting in the inbound queue"
    ).expect("metric can be created");

    // ============ Latency ============

    /// Handler execution time
    pub static ref TASK_EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new("taskworker_task_execution_time_seconds", "Time spent executing a task")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
        &["namespace", "taskname"]
    ).expect("metric can be created");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Worker metrics interface
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Register all metrics with the global registry. Safe to call more than once.
    pub fn register() -> TelemetryResult<()> {
        REGISTERED
            .get_or_init(|| Self::register_metrics().map_err(|e| e.to_string()))
            .clone()
            .map_err(TelemetryError::Metrics)
    }

    fn register_metrics() -> Result<(), prometheus::Error> {
        REGISTRY.register(Box::new(RESULTS_REPORTED.clone()))?;
        REGISTRY.register(Box::new(TASKS_FAILED.clone()))?;
        REGISTRY.register(Box::new(DEADLINE_EXCEEDED.clone()))?;
        REGISTRY.register(Box::new(RESULTS_DROPPED.clone()))?;
        REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
        REGISTRY.register(Box::new(TASKS_FETCHED.clone()))?;
        REGISTRY.register(Box::new(CHILDREN_SPAWNED.clone()))?;
        REGISTRY.register(Box::new(CHILDREN_LIVE.clone()))?;
        REGISTRY.register(Box::new(INBOUND_QUEUE_DEPTH.clone()))?;
        REGISTRY.register(Box::new(TASK_EXECUTION_TIME.clone()))?;
        Ok(())
    }

    /// Get metrics as Prometheus text format
    pub fn gather() -> TelemetryResult<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }

    /// Record a result accepted by the broker
    pub fn result_reported(status: &str) {
        RESULTS_REPORTED.with_label_values(&[status]).inc();
    }

    /// Record a non-complete result
    pub fn task_failed(reason: &str) {
        TASKS_FAILED.with_label_values(&[reason]).inc();
    }

    /// Record a deadline breach
    pub fn deadline_exceeded(namespace: &str, taskname: &str) {
        DEADLINE_EXCEEDED
            .with_label_values(&[namespace, taskname])
            .inc();
    }

    /// Record handler execution time
    pub fn record_execution_time(namespace: &str, taskname: &str, duration_secs: f64) {
        TASK_EXECUTION_TIME
            .with_label_values(&[namespace, taskname])
            .observe(duration_secs);
    }

    /// Record a failed broker call
    pub fn rpc_error(method: &str, code: &str) {
        RPC_ERRORS.with_label_values(&[method, code]).inc();
    }

    /// Record a received activation
    pub fn task_fetched(source: &str) {
        TASKS_FETCHED.with_label_values(&[source]).inc();
    }

    /// Record a result that will never reach the broker
    pub fn result_dropped(reason: &str) {
        RESULTS_DROPPED.with_label_values(&[reason]).inc();
    }

    pub fn child_spawned() {
        CHILDREN_SPAWNED.inc();
    }

    pub fn set_live_children(count: i64) {
        CHILDREN_LIVE.set(count);
    }

    pub fn set_inbound_depth(depth: i64) {
        INBOUND_QUEUE_DEPTH.set(depth);
    }
}

/// Records execution time when dropped
pub struct ExecutionTimer {
    start: Instant,
    namespace: String,
    taskname: String,
}

impl ExecutionTimer {
    pub fn start(namespace: &str, taskname: &str) -> Self {
        Self {
            start: Instant::now(),
            namespace: namespace.to_string(),
            taskname: taskname.to_string(),
        }
    }
}

impl Drop for ExecutionTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        WorkerMetrics::record_execution_time(&self.namespace, &self.taskname, duration);
    }
}

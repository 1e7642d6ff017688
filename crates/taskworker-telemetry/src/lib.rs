//! Taskworker Telemetry - Observability layer
//!
//! This crate provides observability for the taskworker:
//! - Structured logging (JSON, pretty or compact) via `tracing-subscriber`
//! - Prometheus metrics for results, deadlines, RPC errors and the child pool
//!
//! Enable features via feature flags:
//! - `metrics` (default) - Prometheus metrics; without it every recording call is a no-op

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(not(feature = "metrics"))]
pub mod metrics {
    //! Metrics disabled at build time

    use std::time::Instant;

    pub struct WorkerMetrics;

    impl WorkerMetrics {
        pub fn register() -> crate::TelemetryResult<()> {
            Ok(())
        }
        pub fn gather() -> crate::TelemetryResult<String> {
            Ok(String::new())
        }
        pub fn result_reported(_status: &str) {}
        pub fn task_failed(_reason: &str) {}
        pub fn deadline_exceeded(_namespace: &str, _taskname: &str) {}
        pub fn record_execution_time(_namespace: &str, _taskname: &str, _duration_secs: f64) {}
        pub fn rpc_error(_method: &str, _code: &str) {}
        pub fn task_fetched(_source: &str) {}
        pub fn result_dropped(_reason: &str) {}
        pub fn child_spawned() {}
        pub fn set_live_children(_count: i64) {}
        pub fn set_inbound_depth(_depth: i64) {}
    }

    pub struct ExecutionTimer {
        _start: Instant,
    }

    impl ExecutionTimer {
        pub fn start(_namespace: &str, _taskname: &str) -> Self {
            Self {
                _start: Instant::now(),
            }
        }
    }
}

pub mod logging;

// Re-exports
pub use logging::{init_logging, LogFormat, LogWriter, LoggingConfig, TaskLogContext};
pub use metrics::{ExecutionTimer, WorkerMetrics};

use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

//! Check-in and error reporting for executed activations

use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Status recorded for a scheduled task's check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Ok,
    Error,
}

/// Check-in for an activation that carried monitor headers
#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub monitor_slug: String,
    pub check_in_id: String,
    pub duration: Duration,
    pub status: MonitorStatus,
}

/// Errors raised while executing an activation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("execution deadline of {deadline:?} exceeded by {taskname} ({task_id})")]
    ProcessingDeadlineExceeded {
        task_id: String,
        taskname: String,
        deadline: Duration,
    },

    #[error("{taskname} ({task_id}) failed: {message}")]
    HandlerFailed {
        task_id: String,
        taskname: String,
        message: String,
    },

    #[error("{taskname} ({task_id}) panicked: {message}")]
    Panicked {
        task_id: String,
        taskname: String,
        message: String,
    },
}

/// Receives check-ins and execution errors
pub trait Monitor: Send + Sync {
    fn capture_checkin(&self, checkin: CheckIn);

    fn capture_error(&self, error: &ExecutionError);
}

/// Monitor that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn capture_checkin(&self, checkin: CheckIn) {
        info!(
            monitor_slug = %checkin.monitor_slug,
            check_in_id = %checkin.check_in_id,
            duration_ms = checkin.duration.as_millis() as u64,
            status = ?checkin.status,
            "Monitor check-in"
        );
    }

    fn capture_error(&self, error: &ExecutionError) {
        error!(error = %error, "Task execution error");
    }
}

/// Monitor that keeps everything in memory
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    checkins: Mutex<Vec<CheckIn>>,
    errors: Mutex<Vec<ExecutionError>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkins(&self) -> Vec<CheckIn> {
        self.checkins.lock().clone()
    }

    pub fn errors(&self) -> Vec<ExecutionError> {
        self.errors.lock().clone()
    }
}

impl Monitor for RecordingMonitor {
    fn capture_checkin(&self, checkin: CheckIn) {
        self.checkins.lock().push(checkin);
    }

    fn capture_error(&self, error: &ExecutionError) {
        self.errors.lock().push(error.clone());
    }
}

//! Task activations, retry state and processing results

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the monitor slug for scheduled tasks
pub const MONITOR_SLUG_HEADER: &str = "sentry-monitor-slug";

/// Header carrying the monitor check-in id for scheduled tasks
pub const MONITOR_CHECK_IN_ID_HEADER: &str = "sentry-monitor-check-in-id";

/// What the broker should do once an activation has used all of its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnAttemptsExceeded {
    #[default]
    Unspecified,
    Discard,
    Deadletter,
}

/// Attempt bookkeeping carried with an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Attempts already made before this delivery
    pub attempts: u32,

    /// Total attempts allowed
    pub max_attempts: u32,

    /// Broker policy once attempts run out
    #[serde(default)]
    pub on_attempts_exceeded: OnAttemptsExceeded,
}

impl RetryState {
    /// Create a retry state with no attempts made yet
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            on_attempts_exceeded: OnAttemptsExceeded::default(),
        }
    }

    /// Set the policy applied once attempts are exhausted
    pub fn on_attempts_exceeded(mut self, policy: OnAttemptsExceeded) -> Self {
        self.on_attempts_exceeded = policy;
        self
    }

    /// True when the current attempt is the last one allowed
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts.saturating_add(1) >= self.max_attempts
    }

    /// Attempts left after the current one
    pub fn remaining(&self) -> u32 {
        self.max_attempts
            .saturating_sub(self.attempts.saturating_add(1))
    }
}

/// One delivery attempt of a task to this worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskActivation {
    /// Unique per delivery attempt
    pub id: String,

    /// Task namespace
    pub namespace: String,

    /// Task name within the namespace
    pub taskname: String,

    /// Serialized arguments (`{"args": [...], "kwargs": {...}}`)
    #[serde(default)]
    pub parameters: String,

    /// Free-form headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Wall-clock budget for one execution, in seconds
    #[serde(default)]
    pub processing_deadline_duration: u64,

    /// Attempt bookkeeping, if the task is retryable
    #[serde(default)]
    pub retry_state: Option<RetryState>,
}

impl TaskActivation {
    /// Create an activation with no arguments
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        taskname: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            taskname: taskname.into(),
            parameters: r#"{"args": [], "kwargs": {}}"#.to_string(),
            headers: HashMap::new(),
            processing_deadline_duration: 0,
            retry_state: None,
        }
    }

    /// Set the serialized parameters
    pub fn parameters(mut self, parameters: impl Into<String>) -> Self {
        self.parameters = parameters.into();
        self
    }

    /// Set the processing deadline
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.processing_deadline_duration = deadline.as_secs();
        self
    }

    /// Set the retry state
    pub fn retry_state(mut self, state: RetryState) -> Self {
        self.retry_state = Some(state);
        self
    }

    /// Add a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Processing deadline as a duration
    pub fn processing_deadline(&self) -> Duration {
        Duration::from_secs(self.processing_deadline_duration)
    }

    /// Monitor slug and check-in id, when both headers are present
    pub fn monitor_checkin(&self) -> Option<(&str, &str)> {
        let slug = self.headers.get(MONITOR_SLUG_HEADER)?;
        let check_in_id = self.headers.get(MONITOR_CHECK_IN_ID_HEADER)?;
        Some((slug.as_str(), check_in_id.as_str()))
    }

    /// Decode the parameters blob
    pub fn decode_parameters(&self) -> crate::Result<Parameters> {
        Parameters::from_json(&self.parameters)
    }

    /// Fully qualified name, for logs
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.namespace, self.taskname)
    }
}

/// Decoded task arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: HashMap<String, serde_json::Value>,
}

impl Parameters {
    /// Parse a parameters blob; an empty blob means no arguments
    pub fn from_json(blob: &str) -> crate::Result<Self> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(blob).map_err(|e| crate::Error::InvalidParameters(e.to_string()))
    }

    /// Deserialize a positional argument
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: usize) -> crate::Result<Option<T>> {
        self.args
            .get(index)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| crate::Error::InvalidParameters(e.to_string()))
    }

    /// Deserialize a keyword argument
    pub fn kwarg<T: serde::de::DeserializeOwned>(&self, key: &str) -> crate::Result<Option<T>> {
        self.kwargs
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| crate::Error::InvalidParameters(e.to_string()))
    }
}

/// Outcome reported to the broker for one activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Failure,
    Retry,
    Complete,
}

impl ActivationStatus {
    /// Wire value in the broker protocol
    pub fn as_proto(&self) -> i32 {
        match self {
            ActivationStatus::Failure => 3,
            ActivationStatus::Retry => 4,
            ActivationStatus::Complete => 5,
        }
    }

    /// Parse a wire value; non-terminal statuses are rejected
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            3 => Some(ActivationStatus::Failure),
            4 => Some(ActivationStatus::Retry),
            5 => Some(ActivationStatus::Complete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Failure => "failure",
            ActivationStatus::Retry => "retry",
            ActivationStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition behind a non-complete result. Local only, never sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownTask,
    InvalidParameters,
    HandlerError,
    Panicked,
    DeadlineExceeded,
    NoRetriesRemaining,
    RetryRequested,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownTask => "unknown_task",
            FailureReason::InvalidParameters => "invalid_parameters",
            FailureReason::HandlerError => "handler_error",
            FailureReason::Panicked => "panicked",
            FailureReason::DeadlineExceeded => "deadline_exceeded",
            FailureReason::NoRetriesRemaining => "no_retries_remaining",
            FailureReason::RetryRequested => "retry_requested",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing one activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Activation id
    pub task_id: String,

    /// Reported status
    pub status: ActivationStatus,

    /// Retry state forwarded with RETRY
    #[serde(default)]
    pub retry_state: Option<RetryState>,

    /// Why the task did not complete
    #[serde(default)]
    pub failure: Option<FailureReason>,
}

impl ProcessingResult {
    /// A completed result
    pub fn complete(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ActivationStatus::Complete,
            retry_state: None,
            failure: None,
        }
    }

    /// A failed result
    pub fn failure(task_id: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            task_id: task_id.into(),
            status: ActivationStatus::Failure,
            retry_state: None,
            failure: Some(reason),
        }
    }

    /// A retry result carrying the state the broker should act on
    pub fn retry(
        task_id: impl Into<String>,
        retry_state: Option<RetryState>,
        reason: FailureReason,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: ActivationStatus::Retry,
            retry_state,
            failure: Some(reason),
        }
    }

    /// True if the deadline was exceeded
    pub fn is_deadline_exceeded(&self) -> bool {
        self.failure == Some(FailureReason::DeadlineExceeded)
    }
}

/// Piggyback request for the next activation on a status update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchNextTask {
    /// Restrict the next activation to this namespace
    pub namespace: Option<String>,
}

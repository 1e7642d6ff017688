//! Task registry: maps (namespace, name) to a handler and its retry policy

use crate::context::TaskContext;
use std::collections::HashMap;
use std::sync::Arc;
use taskworker_core::{
    Error, FailureReason, OnAttemptsExceeded, Parameters, ProcessingResult, Result, RetryState,
    TaskActivation,
};
use thiserror::Error;

/// Why a handler did not complete
#[derive(Error, Debug)]
pub enum TaskError {
    /// The handler asked for another attempt
    #[error("retry requested")]
    Retry,

    /// The handler asked for another attempt but none are left
    #[error("no retries remaining")]
    NoRetriesRemaining,

    /// The handler failed
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// Wrap any displayable error as a handler failure
    pub fn failed(message: impl std::fmt::Display) -> Self {
        TaskError::Failed(anyhow::anyhow!("{}", message))
    }
}

/// Trait for task handlers
pub trait TaskHandler: Send + Sync + 'static {
    /// Execute one activation
    fn call(&self, ctx: &TaskContext, params: &Parameters) -> std::result::Result<(), TaskError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskContext, &Parameters) -> std::result::Result<(), TaskError> + Send + Sync + 'static,
{
    fn call(&self, ctx: &TaskContext, params: &Parameters) -> std::result::Result<(), TaskError> {
        self(ctx, params)
    }
}

/// How a task is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed
    pub times: u32,

    /// Retry when the handler fails, not only when it asks to
    pub retry_on_error: bool,

    /// Broker policy once attempts run out
    pub times_exceeded: OnAttemptsExceeded,
}

impl RetryPolicy {
    pub fn new(times: u32) -> Self {
        Self {
            times,
            retry_on_error: false,
            times_exceeded: OnAttemptsExceeded::Discard,
        }
    }

    pub fn retry_on_error(mut self, enabled: bool) -> Self {
        self.retry_on_error = enabled;
        self
    }

    pub fn times_exceeded(mut self, policy: OnAttemptsExceeded) -> Self {
        self.times_exceeded = policy;
        self
    }

    /// Retry state for an activation that arrived without one
    pub fn initial_state(&self) -> RetryState {
        RetryState::new(self.times).on_attempts_exceeded(self.times_exceeded)
    }
}

/// A registered task
pub struct TaskDefinition {
    namespace: String,
    name: String,
    handler: Arc<dyn TaskHandler>,
    retry: Option<RetryPolicy>,
    at_most_once: bool,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("at_most_once", &self.at_most_once)
            .finish()
    }
}

impl TaskDefinition {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        handler: impl TaskHandler,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            handler: Arc::new(handler),
            retry: None,
            at_most_once: false,
        }
    }

    /// Set the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Execute at most once per activation id
    pub fn at_most_once(mut self, enabled: bool) -> Self {
        self.at_most_once = enabled;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    pub fn is_at_most_once(&self) -> bool {
        self.at_most_once
    }

    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }

    /// Retry state for this attempt: the activation's own, else one from the policy
    pub fn effective_retry_state(&self, activation: &TaskActivation) -> Option<RetryState> {
        activation
            .retry_state
            .or_else(|| self.retry.map(|policy| policy.initial_state()))
    }

    /// Map a handler outcome to the result reported to the broker
    pub fn resolve(
        &self,
        task_id: &str,
        retry_state: Option<RetryState>,
        outcome: std::result::Result<(), TaskError>,
    ) -> ProcessingResult {
        match outcome {
            Ok(()) => ProcessingResult::complete(task_id),
            Err(TaskError::Retry) => {
                ProcessingResult::retry(task_id, retry_state, FailureReason::RetryRequested)
            }
            Err(TaskError::NoRetriesRemaining) => {
                ProcessingResult::failure(task_id, FailureReason::NoRetriesRemaining)
            }
            Err(TaskError::Failed(_)) => {
                let retryable = self.retry.map(|p| p.retry_on_error).unwrap_or(false)
                    && retry_state.map(|s| !s.attempts_exhausted()).unwrap_or(false);
                if retryable {
                    ProcessingResult::retry(task_id, retry_state, FailureReason::HandlerError)
                } else {
                    ProcessingResult::failure(task_id, FailureReason::HandlerError)
                }
            }
        }
    }
}

/// Registered tasks, keyed by namespace and name
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<(String, String), Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A second registration of the same name is an error.
    pub fn register(&mut self, definition: TaskDefinition) -> Result<()> {
        let key = (definition.namespace.clone(), definition.name.clone());
        if self.tasks.contains_key(&key) {
            return Err(Error::DuplicateTask {
                namespace: key.0,
                name: key.1,
            });
        }
        self.tasks.insert(key, Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<TaskDefinition>> {
        self.tasks
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.lookup(namespace, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered names as `namespace:name`, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .keys()
            .map(|(ns, name)| format!("{}:{}", ns, name))
            .collect();
        names.sort();
        names
    }
}

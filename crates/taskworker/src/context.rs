//! Execution context handed to task handlers
//!
//! Handlers receive a [`TaskContext`] explicitly. Helper code that has no
//! access to it can call [`current_task`], which reads a thread-local slot set
//! for the duration of a handler call by [`CurrentTaskGuard`].

use crate::registry::TaskError;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskworker_core::{RetryState, TaskActivation};

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskActivation>>> = const { RefCell::new(None) };
}

/// The activation being executed on this thread, if any
pub fn current_task() -> Option<Arc<TaskActivation>> {
    CURRENT_TASK.with(|slot| slot.borrow().clone())
}

/// Sets the current task for this thread and restores the previous value on drop,
/// including when the handler panics.
pub struct CurrentTaskGuard {
    previous: Option<Arc<TaskActivation>>,
}

impl CurrentTaskGuard {
    pub fn enter(activation: Arc<TaskActivation>) -> Self {
        let previous = CURRENT_TASK.with(|slot| slot.borrow_mut().replace(activation));
        Self { previous }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Per-activation context
#[derive(Debug, Clone)]
pub struct TaskContext {
    activation: Arc<TaskActivation>,
    retry_state: Option<RetryState>,
    deadline: Duration,
    started: Instant,
}

impl TaskContext {
    pub fn new(
        activation: Arc<TaskActivation>,
        retry_state: Option<RetryState>,
        deadline: Duration,
    ) -> Self {
        Self {
            activation,
            retry_state,
            deadline,
            started: Instant::now(),
        }
    }

    pub fn activation(&self) -> &TaskActivation {
        &self.activation
    }

    pub(crate) fn shared_activation(&self) -> Arc<TaskActivation> {
        Arc::clone(&self.activation)
    }

    pub fn id(&self) -> &str {
        &self.activation.id
    }

    /// Retry state in effect for this attempt
    pub fn retry_state(&self) -> Option<RetryState> {
        self.retry_state
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    /// Error to return when the handler wants another attempt.
    ///
    /// Yields [`TaskError::NoRetriesRemaining`] when this is the last attempt or
    /// the task is not retryable at all.
    pub fn retry(&self) -> TaskError {
        match self.retry_state {
            Some(state) if !state.attempts_exhausted() => TaskError::Retry,
            _ => TaskError::NoRetriesRemaining,
        }
    }
}

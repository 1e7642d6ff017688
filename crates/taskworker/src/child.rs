//! Child executor: the loop that runs inside every pool child
//!
//! A child pulls one activation at a time from an [`ActivationSource`], runs
//! its handler on a dedicated thread under the processing deadline, and pushes
//! exactly one [`ProcessingResult`] per executed activation into a
//! [`ResultSink`]. When a handler overruns its deadline the child reports the
//! failure and ends; in a child process that exit takes the runaway handler
//! thread down with it.

use crate::context::{CurrentTaskGuard, TaskContext};
use crate::monitor::{CheckIn, ExecutionError, Monitor, MonitorStatus};
use crate::registry::{TaskDefinition, TaskError, TaskRegistry};
use crate::shutdown::ShutdownSignal;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskworker_core::{ActivationStatus, FailureReason, ProcessingResult, TaskActivation};
use taskworker_telemetry::{
    log_task_completed, log_task_failed, log_task_retried, log_task_started, ExecutionTimer,
    TaskLogContext, WorkerMetrics,
};
use tracing::{debug, info, warn};

/// Exit status of a child process that ended because a handler overran its deadline
pub const DEADLINE_EXCEEDED_EXIT_CODE: i32 = 124;

/// Outcome of one fetch from an activation source
#[derive(Debug)]
pub enum Fetch {
    Activation(TaskActivation),
    /// Nothing arrived within the timeout
    Empty,
    /// The parent asked the child to stop
    Shutdown,
    /// The source is gone
    Closed,
}

/// Where a child reads activations from
pub trait ActivationSource {
    fn fetch(&mut self, timeout: Duration) -> Fetch;
}

/// Where a child writes results to
pub trait ResultSink {
    /// Deliver a result. Returns `false` once the sink is closed.
    fn send(&mut self, result: ProcessingResult) -> bool;
}

impl ActivationSource for Receiver<TaskActivation> {
    fn fetch(&mut self, timeout: Duration) -> Fetch {
        match self.recv_timeout(timeout) {
            Ok(activation) => Fetch::Activation(activation),
            Err(RecvTimeoutError::Timeout) => Fetch::Empty,
            Err(RecvTimeoutError::Disconnected) => Fetch::Closed,
        }
    }
}

impl ResultSink for Sender<ProcessingResult> {
    fn send(&mut self, result: ProcessingResult) -> bool {
        Sender::send(self, result).is_ok()
    }
}

/// Why a child loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Shutdown was signalled
    Shutdown,
    /// The child executed its task limit and should be replaced
    MaxTasksReached,
    /// The activation source closed
    SourceClosed,
    /// The result sink closed
    SinkClosed,
    /// A handler overran its deadline
    DeadlineExceeded,
}

impl ChildExit {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildExit::DeadlineExceeded => DEADLINE_EXCEEDED_EXIT_CODE,
            ChildExit::SinkClosed => 1,
            _ => 0,
        }
    }
}

/// Child executor settings
#[derive(Debug, Clone)]
pub struct ChildOptions {
    /// Executed activations before the child retires (None or 0 = unlimited)
    pub max_task_count: Option<u64>,

    /// How long one fetch waits before the shutdown flag is checked again
    pub poll_interval: Duration,

    /// Deadline for activations that carry none
    pub default_deadline: Duration,

    /// Replaces every activation's deadline
    pub deadline_override: Option<Duration>,

    /// Record outcome metrics. Off in child processes, where the worker records them.
    pub record_metrics: bool,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            max_task_count: None,
            poll_interval: Duration::from_millis(100),
            default_deadline: Duration::from_secs(10),
            deadline_override: None,
            record_metrics: true,
        }
    }
}

impl ChildOptions {
    /// Deadline applied to an activation
    pub fn deadline_for(&self, activation: &TaskActivation) -> Duration {
        if let Some(deadline) = self.deadline_override {
            return deadline;
        }
        match activation.processing_deadline() {
            d if d.is_zero() => self.default_deadline,
            d => d,
        }
    }

    fn task_limit(&self) -> Option<u64> {
        self.max_task_count.filter(|max| *max > 0)
    }
}

/// Count a finished activation in the worker metrics
pub fn record_outcome(namespace: &str, taskname: &str, result: &ProcessingResult) {
    match (result.status, result.failure) {
        (ActivationStatus::Complete, _) => {}
        (ActivationStatus::Retry, reason) => {
            WorkerMetrics::task_failed(reason.map(|r| r.as_str()).unwrap_or("retry"));
        }
        (ActivationStatus::Failure, reason) => {
            if reason == Some(FailureReason::DeadlineExceeded) {
                WorkerMetrics::deadline_exceeded(namespace, taskname);
            }
            WorkerMetrics::task_failed(reason.map(|r| r.as_str()).unwrap_or("failure"));
        }
    }
}

/// Outcome of executing one activation
struct Execution {
    result: ProcessingResult,
    deadline_exceeded: bool,
}

/// Runs activations against the registry
pub struct ChildExecutor {
    registry: Arc<TaskRegistry>,
    monitor: Arc<dyn Monitor>,
    options: ChildOptions,
}

impl ChildExecutor {
    pub fn new(registry: Arc<TaskRegistry>, monitor: Arc<dyn Monitor>, options: ChildOptions) -> Self {
        Self {
            registry,
            monitor,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ChildOptions {
        &self.options
    }

    /// Deadline applied to an activation
    pub fn deadline_for(&self, activation: &TaskActivation) -> Duration {
        self.options.deadline_for(activation)
    }

    /// Run until shutdown, the task limit, a closed source or sink, or a deadline breach
    pub fn run<S, K>(&self, source: &mut S, sink: &mut K, shutdown: &ShutdownSignal) -> ChildExit
    where
        S: ActivationSource + ?Sized,
        K: ResultSink + ?Sized,
    {
        let mut processed: u64 = 0;

        loop {
            if shutdown.is_set() {
                debug!(processed, "Child received shutdown");
                return ChildExit::Shutdown;
            }
            if let Some(max) = self.options.task_limit() {
                if processed >= max {
                    info!(processed, "Child reached its task limit");
                    return ChildExit::MaxTasksReached;
                }
            }

            let activation = match source.fetch(self.options.poll_interval) {
                Fetch::Activation(activation) => activation,
                Fetch::Empty => continue,
                Fetch::Shutdown => return ChildExit::Shutdown,
                Fetch::Closed => return ChildExit::SourceClosed,
            };

            let Some(task) = self.registry.lookup(&activation.namespace, &activation.taskname) else {
                warn!(
                    task_id = %activation.id,
                    namespace = %activation.namespace,
                    taskname = %activation.taskname,
                    "Unknown task, discarding"
                );
                let result = ProcessingResult::failure(&activation.id, FailureReason::UnknownTask);
                if self.options.record_metrics {
                    record_outcome(&activation.namespace, &activation.taskname, &result);
                }
                if !sink.send(result) {
                    return ChildExit::SinkClosed;
                }
                continue;
            };

            processed += 1;
            let execution = self.execute(&task, activation);
            if !sink.send(execution.result) {
                return ChildExit::SinkClosed;
            }
            if execution.deadline_exceeded {
                return ChildExit::DeadlineExceeded;
            }
        }
    }

    fn execute(&self, task: &Arc<TaskDefinition>, activation: TaskActivation) -> Execution {
        let log_ctx = TaskLogContext::new(&activation.id, &activation.namespace, &activation.taskname);
        let _span = log_ctx.span().entered();

        let deadline = self.deadline_for(&activation);
        let retry_state = task.effective_retry_state(&activation);
        let activation = Arc::new(activation);
        let task_id = activation.id.clone();
        let start = Instant::now();

        log_task_started!(task_id, activation.taskname, activation.namespace);

        let params = match activation.decode_parameters() {
            Ok(params) => params,
            Err(e) => {
                log_task_failed!(task_id, activation.taskname, activation.namespace, e);
                let result = ProcessingResult::failure(&task_id, FailureReason::InvalidParameters);
                if self.options.record_metrics {
                    record_outcome(&activation.namespace, &activation.taskname, &result);
                }
                self.checkin(&activation, &result, start.elapsed());
                return Execution {
                    result,
                    deadline_exceeded: false,
                };
            }
        };

        let ctx = TaskContext::new(Arc::clone(&activation), retry_state, deadline);
        let handler = task.handler();
        let (done_tx, done_rx) = channel::bounded(1);
        let timer = self
            .options
            .record_metrics
            .then(|| ExecutionTimer::start(&activation.namespace, &activation.taskname));

        let spawned = std::thread::Builder::new()
            .name(format!("task-{}", task_id))
            .spawn(move || {
                let _current = CurrentTaskGuard::enter(ctx.shared_activation());
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(&ctx, &params)));
                // the receiver is gone when the deadline already fired
                let _ = done_tx.send(outcome);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                log_task_failed!(task_id, activation.taskname, activation.namespace, e);
                let result = ProcessingResult::failure(&task_id, FailureReason::HandlerError);
                if self.options.record_metrics {
                    record_outcome(&activation.namespace, &activation.taskname, &result);
                }
                self.checkin(&activation, &result, start.elapsed());
                return Execution {
                    result,
                    deadline_exceeded: false,
                };
            }
        };

        let (result, deadline_exceeded) = match done_rx.recv_timeout(deadline) {
            Ok(Ok(outcome)) => {
                let _ = handle.join();
                if let Err(TaskError::Failed(ref e)) = outcome {
                    self.monitor.capture_error(&ExecutionError::HandlerFailed {
                        task_id: task_id.clone(),
                        taskname: activation.taskname.clone(),
                        message: format!("{:#}", e),
                    });
                }
                (task.resolve(&task_id, retry_state, outcome), false)
            }
            Ok(Err(payload)) => {
                let _ = handle.join();
                let message = panic_message(payload.as_ref());
                self.monitor.capture_error(&ExecutionError::Panicked {
                    task_id: task_id.clone(),
                    taskname: activation.taskname.clone(),
                    message,
                });
                (ProcessingResult::failure(&task_id, FailureReason::Panicked), false)
            }
            Err(RecvTimeoutError::Timeout) => {
                // the handler thread is left running; the child ends after reporting
                self.monitor.capture_error(&ExecutionError::ProcessingDeadlineExceeded {
                    task_id: task_id.clone(),
                    taskname: activation.taskname.clone(),
                    deadline,
                });
                (ProcessingResult::failure(&task_id, FailureReason::DeadlineExceeded), true)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                (ProcessingResult::failure(&task_id, FailureReason::Panicked), false)
            }
        };
        drop(timer);

        let elapsed = start.elapsed();
        match (result.status, result.failure) {
            (ActivationStatus::Complete, _) => {
                log_task_completed!(
                    task_id,
                    activation.taskname,
                    activation.namespace,
                    elapsed.as_millis() as u64
                );
            }
            (ActivationStatus::Retry, reason) => {
                let attempts = retry_state.map(|s| s.attempts).unwrap_or(0);
                let reason = reason.map(|r| r.as_str()).unwrap_or("retry");
                log_task_retried!(task_id, activation.taskname, activation.namespace, attempts, reason);
            }
            (ActivationStatus::Failure, reason) => {
                let reason = reason.map(|r| r.as_str()).unwrap_or("failure");
                log_task_failed!(task_id, activation.taskname, activation.namespace, reason);
            }
        }
        if self.options.record_metrics {
            record_outcome(&activation.namespace, &activation.taskname, &result);
        }

        self.checkin(&activation, &result, elapsed);

        Execution {
            result,
            deadline_exceeded,
        }
    }

    fn checkin(&self, activation: &TaskActivation, result: &ProcessingResult, duration: Duration) {
        let Some((slug, check_in_id)) = activation.monitor_checkin() else {
            return;
        };
        let status = match result.status {
            ActivationStatus::Complete => MonitorStatus::Ok,
            _ => MonitorStatus::Error,
        };
        self.monitor.capture_checkin(CheckIn {
            monitor_slug: slug.to_string(),
            check_in_id: check_in_id.to_string(),
            duration,
            status,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::register_builtin_tasks;
    use crate::monitor::RecordingMonitor;
    use taskworker_core::{
        OnAttemptsExceeded, RetryState, MONITOR_CHECK_IN_ID_HEADER, MONITOR_SLUG_HEADER,
    };

    fn executor(max_task_count: u64, monitor: Arc<RecordingMonitor>) -> ChildExecutor {
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry).unwrap();
        ChildExecutor::new(
            Arc::new(registry),
            monitor,
            ChildOptions {
                max_task_count: Some(max_task_count),
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    fn activation(id: &str, taskname: &str) -> TaskActivation {
        TaskActivation::new(id, "examples", taskname).deadline(Duration::from_secs(2))
    }

    fn run_child(
        executor: &ChildExecutor,
        activations: Vec<TaskActivation>,
        shutdown: &ShutdownSignal,
    ) -> (ChildExit, Vec<ProcessingResult>, usize) {
        let (todo_tx, mut todo_rx) = channel::bounded(10);
        let (mut done_tx, done_rx) = channel::bounded(10);
        for a in activations {
            todo_tx.send(a).unwrap();
        }
        let exit = executor.run(&mut todo_rx, &mut done_tx, shutdown);
        (exit, done_rx.try_iter().collect(), todo_rx.len())
    }

    #[test]
    fn test_child_complete() {
        let monitor = Arc::new(RecordingMonitor::new());
        let executor = executor(1, monitor.clone());
        let (exit, results, left) = run_child(
            &executor,
            vec![activation("111", "examples.simple_task")],
            &ShutdownSignal::new(),
        );

        assert_eq!(exit, ChildExit::MaxTasksReached);
        assert_eq!(left, 0);
        assert_eq!(results, vec![ProcessingResult::complete("111")]);
        assert!(monitor.checkins().is_empty());
    }

    #[test]
    fn test_child_retry_and_failure() {
        let executor = executor(2, Arc::new(RecordingMonitor::new()));
        let retry = activation("222", "examples.retry_task").retry_state(RetryState::new(3));
        let (_, results, _) = run_child(
            &executor,
            vec![retry, activation("333", "examples.fail_task")],
            &ShutdownSignal::new(),
        );

        assert_eq!(results[0].task_id, "222");
        assert_eq!(results[0].status, ActivationStatus::Retry);
        assert_eq!(results[0].retry_state.map(|s| s.max_attempts), Some(3));
        assert_eq!(results[1].task_id, "333");
        assert_eq!(results[1].status, ActivationStatus::Failure);
    }

    #[test]
    fn test_child_shutdown_set_processes_nothing() {
        let executor = executor(1, Arc::new(RecordingMonitor::new()));
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let (exit, results, left) =
            run_child(&executor, vec![activation("111", "examples.simple_task")], &shutdown);
        assert_eq!(exit, ChildExit::Shutdown);
        assert!(results.is_empty());
        assert_eq!(left, 1);
    }

    #[test]
    fn test_unknown_task_is_not_counted() {
        let executor = executor(1, Arc::new(RecordingMonitor::new()));
        let unknown = TaskActivation::new("444", "lolnope", "total.rubbish");
        let (exit, results, _) = run_child(
            &executor,
            vec![unknown, activation("111", "examples.simple_task")],
            &ShutdownSignal::new(),
        );

        assert_eq!(exit, ChildExit::MaxTasksReached);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task_id, "444");
        assert_eq!(results[0].status, ActivationStatus::Failure);
        assert_eq!(results[0].failure, Some(FailureReason::UnknownTask));
        assert_eq!(results[1], ProcessingResult::complete("111"));
    }

    #[test]
    fn test_zero_task_limit_means_unlimited() {
        let executor = executor(0, Arc::new(RecordingMonitor::new()));
        let (todo_tx, mut todo_rx) = channel::bounded(10);
        let (mut done_tx, done_rx) = channel::bounded(10);
        todo_tx.send(activation("111", "examples.simple_task")).unwrap();
        todo_tx.send(activation("112", "examples.simple_task")).unwrap();
        drop(todo_tx);

        let exit = executor.run(&mut todo_rx, &mut done_tx, &ShutdownSignal::new());
        assert_eq!(exit, ChildExit::SourceClosed);
        assert_eq!(done_rx.try_iter().count(), 2);
    }

    #[test]
    fn test_huge_deadline_does_not_overflow() {
        let executor = executor(1, Arc::new(RecordingMonitor::new()));
        let mut task = activation("555", "examples.at_most_once");
        task.processing_deadline_duration = u64::MAX;
        assert_eq!(executor.deadline_for(&task), Duration::from_secs(u64::MAX));

        let (exit, results, _) = run_child(&executor, vec![task], &ShutdownSignal::new());
        assert_eq!(exit, ChildExit::MaxTasksReached);
        assert_eq!(results, vec![ProcessingResult::complete("555")]);
    }

    #[test]
    fn test_record_outcome_counts_deadline() {
        use taskworker_telemetry::metrics::{DEADLINE_EXCEEDED, TASKS_FAILED};

        let labels = ["examples", "examples.recorded"];
        let before = DEADLINE_EXCEEDED.with_label_values(&labels).get();
        let failed_before = TASKS_FAILED.with_label_values(&["deadline_exceeded"]).get();

        let result = ProcessingResult::failure("1", FailureReason::DeadlineExceeded);
        record_outcome(labels[0], labels[1], &result);
        record_outcome(labels[0], labels[1], &ProcessingResult::complete("2"));

        assert_eq!(DEADLINE_EXCEEDED.with_label_values(&labels).get(), before + 1);
        assert!(TASKS_FAILED.with_label_values(&["deadline_exceeded"]).get() > failed_before);
    }

    #[test]
    fn test_redelivery_without_at_most_once_runs_twice() {
        let executor = executor(2, Arc::new(RecordingMonitor::new()));
        let (_, results, _) = run_child(
            &executor,
            vec![
                activation("111", "examples.simple_task"),
                activation("111", "examples.simple_task"),
            ],
            &ShutdownSignal::new(),
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_checkin_recorded() {
        let monitor = Arc::new(RecordingMonitor::new());
        let executor = executor(1, monitor.clone());
        let scheduled = activation("111", "examples.simple_task")
            .header(MONITOR_SLUG_HEADER, "simple-task")
            .header(MONITOR_CHECK_IN_ID_HEADER, "abc123");

        let (_, results, _) = run_child(&executor, vec![scheduled], &ShutdownSignal::new());
        assert_eq!(results[0].status, ActivationStatus::Complete);

        let checkins = monitor.checkins();
        assert_eq!(checkins.len(), 1);
        assert_eq!(checkins[0].monitor_slug, "simple-task");
        assert_eq!(checkins[0].check_in_id, "abc123");
        assert_eq!(checkins[0].status, MonitorStatus::Ok);
    }

    #[test]
    fn test_deadline_exceeded() {
        let monitor = Arc::new(RecordingMonitor::new());
        let executor = executor(1, monitor.clone());
        let sleepy = TaskActivation::new("111", "examples", "examples.timed")
            .parameters(r#"{"args": [3], "kwargs": {}}"#)
            .deadline(Duration::from_secs(1));

        let started = Instant::now();
        let (exit, results, left) = run_child(&executor, vec![sleepy], &ShutdownSignal::new());

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(exit, ChildExit::DeadlineExceeded);
        assert_eq!(left, 0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ActivationStatus::Failure);
        assert!(results[0].is_deadline_exceeded());

        let errors = monitor.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            ExecutionError::ProcessingDeadlineExceeded { .. }
        ));
    }

    #[test]
    fn test_retry_state_no_retries_remaining_completes() {
        let executor = executor(1, Arc::new(RecordingMonitor::new()));
        let task = activation("654", "examples.retry_state").retry_state(
            RetryState {
                attempts: 1,
                max_attempts: 2,
                on_attempts_exceeded: OnAttemptsExceeded::Discard,
            },
        );

        let (_, results, _) = run_child(&executor, vec![task], &ShutdownSignal::new());
        assert_eq!(results, vec![ProcessingResult::complete("654")]);
        assert!(crate::context::current_task().is_none());
    }

    #[test]
    fn test_invalid_parameters_fail_without_running() {
        let executor = executor(1, Arc::new(RecordingMonitor::new()));
        let broken = activation("777", "examples.simple_task").parameters("{not json");

        let (exit, results, _) = run_child(&executor, vec![broken], &ShutdownSignal::new());
        assert_eq!(exit, ChildExit::MaxTasksReached);
        assert_eq!(results[0].failure, Some(FailureReason::InvalidParameters));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let monitor = Arc::new(RecordingMonitor::new());
        let executor = executor(1, monitor.clone());
        let (_, results, _) = run_child(
            &executor,
            vec![activation("888", "examples.panic_task")],
            &ShutdownSignal::new(),
        );

        assert_eq!(results[0].failure, Some(FailureReason::Panicked));
        assert!(matches!(monitor.errors()[0], ExecutionError::Panicked { .. }));
    }

    #[test]
    fn test_deadline_selection() {
        let mut executor = executor(1, Arc::new(RecordingMonitor::new()));
        let task = TaskActivation::new("1", "examples", "examples.simple_task");
        assert_eq!(executor.deadline_for(&task), Duration::from_secs(10));

        let task = task.deadline(Duration::from_secs(4));
        assert_eq!(executor.deadline_for(&task), Duration::from_secs(4));

        executor.options.deadline_override = Some(Duration::from_secs(1));
        assert_eq!(executor.deadline_for(&task), Duration::from_secs(1));
    }
}

//! Result reporter: drains the outbound queue into `update_task` calls
//!
//! Each result is held until the broker accepts it. Transient RPC failures are
//! retried after a fixed backoff; any other failure drops the result. When the
//! pool has room, the update also asks the broker for the next activation,
//! which goes straight into the inbound queue.

use crate::pool::{PoolError, WorkerPool};
use crate::shutdown::ShutdownSignal;
use crossbeam::channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use taskworker_client::BrokerClient;
use taskworker_core::{FetchNextTask, ProcessingResult, TaskActivation};
use taskworker_telemetry::WorkerMetrics;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Reporter settings
#[derive(Debug, Clone)]
pub struct ReporterOptions {
    /// Namespace requested with piggybacked fetches
    pub namespace: Option<String>,

    /// Wait between attempts after a transient failure
    pub retry_backoff: Duration,

    /// How long a piggybacked activation may wait for inbound room
    pub submit_timeout: Duration,

    /// How often an idle reporter checks for shutdown
    pub poll_interval: Duration,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            retry_backoff: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of reporting one result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The broker accepted the result
    Delivered,
    /// The broker rejected the result
    Rejected,
    /// Shutdown interrupted retries of a transient failure
    Abandoned,
}

pub struct ResultReporter<C> {
    client: Arc<C>,
    handle: Handle,
    pool: Arc<WorkerPool>,
    options: ReporterOptions,
}

impl<C: BrokerClient + 'static> ResultReporter<C> {
    pub fn new(
        client: Arc<C>,
        handle: Handle,
        pool: Arc<WorkerPool>,
        options: ReporterOptions,
    ) -> Self {
        Self {
            client,
            handle,
            pool,
            options,
        }
    }

    /// Report results until `stop` is set, then make one attempt for each result still queued
    pub fn run(&self, stop: &ShutdownSignal) {
        let results = self.pool.results();

        while !stop.is_set() {
            match results.recv_timeout(self.options.poll_interval) {
                Ok(result) => {
                    self.report(result, stop);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut delivered = 0;
        let mut dropped = 0;
        for result in results.try_iter() {
            match self.report(result, stop) {
                Delivery::Delivered => delivered += 1,
                _ => dropped += 1,
            }
        }
        info!(delivered, dropped, "Result reporter stopped");
    }

    /// Report one result, retrying transient failures until `stop` is set
    pub fn report(&self, result: ProcessingResult, stop: &ShutdownSignal) -> Delivery {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let fetch_next = (!stop.is_set() && self.pool.has_capacity()).then(|| FetchNextTask {
                namespace: self.options.namespace.clone(),
            });
            let requested_next = fetch_next.is_some();

            let response = self.handle.block_on(self.client.update_task(
                &result.task_id,
                result.status,
                fetch_next,
            ));

            match response {
                Ok(next) => {
                    WorkerMetrics::result_reported(result.status.as_str());
                    debug!(
                        task_id = %result.task_id,
                        status = %result.status,
                        attempts,
                        requested_next,
                        "Reported result"
                    );
                    if let Some(next) = next {
                        self.forward(next);
                    }
                    return Delivery::Delivered;
                }
                Err(e) if e.is_transient() => {
                    WorkerMetrics::rpc_error("update_task", e.code_name());
                    if stop.is_set() {
                        warn!(
                            task_id = %result.task_id,
                            status = %result.status,
                            attempts,
                            error = %e,
                            "Dropping result at shutdown"
                        );
                        WorkerMetrics::result_dropped("shutdown");
                        return Delivery::Abandoned;
                    }
                    warn!(
                        task_id = %result.task_id,
                        attempts,
                        error = %e,
                        "Broker unavailable, retrying result"
                    );
                    std::thread::sleep(self.options.retry_backoff);
                }
                Err(e) => {
                    WorkerMetrics::rpc_error("update_task", e.code_name());
                    WorkerMetrics::result_dropped("rejected");
                    error!(
                        task_id = %result.task_id,
                        status = %result.status,
                        error = %e,
                        "Broker rejected result, dropping it"
                    );
                    return Delivery::Rejected;
                }
            }
        }
    }

    fn forward(&self, next: TaskActivation) {
        let task_id = next.id.clone();
        match self.pool.submit(next, self.options.submit_timeout) {
            Ok(()) => {
                WorkerMetrics::task_fetched("update_task");
                debug!(task_id = %task_id, "Queued activation from update_task");
            }
            Err(PoolError::Full(_)) => {
                warn!(task_id = %task_id, "Inbound queue full, leaving activation to the broker");
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Could not queue activation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{ChildExecutor, ChildOptions};
    use crate::monitor::TracingMonitor;
    use crate::pool::{ChildLauncher, PoolOptions};
    use crate::registry::TaskRegistry;
    use taskworker_client::{Code, MemoryBroker};
    use taskworker_core::ActivationStatus;

    fn idle_pool() -> Arc<WorkerPool> {
        let executor = ChildExecutor::new(
            Arc::new(TaskRegistry::new()),
            Arc::new(TracingMonitor),
            ChildOptions::default(),
        );
        Arc::new(WorkerPool::new(
            ChildLauncher::Thread(Arc::new(executor)),
            PoolOptions {
                inbound_capacity: 1,
                ..Default::default()
            },
        ))
    }

    fn reporter(
        broker: &MemoryBroker,
        runtime: &tokio::runtime::Runtime,
        pool: Arc<WorkerPool>,
    ) -> ResultReporter<MemoryBroker> {
        ResultReporter::new(
            Arc::new(broker.clone()),
            runtime.handle().clone(),
            pool,
            ReporterOptions {
                retry_backoff: Duration::from_millis(5),
                submit_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        broker.fail_update_task(2, Code::Unavailable);
        let reporter = reporter(&broker, &runtime, idle_pool());

        let delivery = reporter.report(ProcessingResult::complete("111"), &ShutdownSignal::new());
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(broker.update_calls(), 3);
        assert_eq!(broker.status_of("111"), Some(ActivationStatus::Complete));
    }

    #[test]
    fn test_terminal_failure_drops_result() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        broker.fail_update_task(1, Code::InvalidArgument);
        let reporter = reporter(&broker, &runtime, idle_pool());

        let delivery = reporter.report(ProcessingResult::complete("111"), &ShutdownSignal::new());
        assert_eq!(delivery, Delivery::Rejected);
        assert_eq!(broker.update_calls(), 1);
        assert!(broker.updates().is_empty());
    }

    #[test]
    fn test_transient_failure_abandoned_at_shutdown() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        broker.fail_update_task(5, Code::Unavailable);
        let reporter = reporter(&broker, &runtime, idle_pool());
        let stop = ShutdownSignal::new();
        stop.trigger();

        assert_eq!(reporter.report(ProcessingResult::complete("111"), &stop), Delivery::Abandoned);
        assert_eq!(broker.update_calls(), 1);
    }

    #[test]
    fn test_next_task_goes_to_inbound_queue() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        broker.push(TaskActivation::new("222", "examples", "examples.simple_task"));
        let pool = idle_pool();
        let reporter = reporter(&broker, &runtime, Arc::clone(&pool));

        reporter.report(ProcessingResult::complete("111"), &ShutdownSignal::new());

        assert_eq!(broker.get_calls(), 0);
        assert_eq!(broker.pending(), 0);
        assert_eq!(pool.inbound_len(), 1);
        assert!(broker.updates()[0].fetch_next.is_some());
    }

    #[test]
    fn test_no_fetch_next_without_capacity() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        broker.push(TaskActivation::new("333", "examples", "examples.simple_task"));
        let pool = idle_pool();
        pool.try_submit(TaskActivation::new("222", "examples", "examples.simple_task"))
            .unwrap();
        let reporter = reporter(&broker, &runtime, Arc::clone(&pool));

        reporter.report(ProcessingResult::complete("111"), &ShutdownSignal::new());

        assert!(broker.updates()[0].fetch_next.is_none());
        assert_eq!(broker.pending(), 1);
    }

    #[test]
    fn test_run_drains_queue_on_stop() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = MemoryBroker::new();
        let pool = idle_pool();
        let sender = pool.result_sender();
        sender.send(ProcessingResult::complete("1")).unwrap();
        sender.send(ProcessingResult::failure("2", taskworker_core::FailureReason::HandlerError))
            .unwrap();
        let reporter = reporter(&broker, &runtime, pool);

        let stop = ShutdownSignal::new();
        stop.trigger();
        reporter.run(&stop);

        assert_eq!(broker.status_of("1"), Some(ActivationStatus::Complete));
        assert_eq!(broker.status_of("2"), Some(ActivationStatus::Failure));
        assert!(broker.updates().iter().all(|u| u.fetch_next.is_none()));
    }
}
